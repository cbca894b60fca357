// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer (`svcagent-core`)
//!
//! Value objects, contracts and pure rules of the service runtime agent.
//! Nothing here touches a process, a container or the network.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`service`] | Service identity, endpoints and the `service.yaml` manifest |
//! | [`network`] | Network mappings and endpoint address resolution |
//! | [`runtime`] | Execution environment and process handle contracts |
//! | [`env`] | Environment variables handed to the service process |
//! | [`lifecycle`] | Lifecycle states, phases and `AgentError` |
//! | [`events`] | Lifecycle events published on the event bus |
//! | [`watch`] | Hot-reload change classification |
//! | [`agent_config`] | Agent configuration manifest |
//! | [`requests`] | Orchestrator request/response types |

pub mod agent_config;
pub mod env;
pub mod events;
pub mod lifecycle;
pub mod network;
pub mod requests;
pub mod runtime;
pub mod service;
pub mod watch;
