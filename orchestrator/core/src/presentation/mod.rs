// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`svcagent-core`)
//!
//! HTTP surface the orchestrator drives the agent through. **No lifecycle
//! logic lives here**; every route delegates to
//! [`ServiceRuntime`](crate::application::ServiceRuntime).
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/JSON (Axum) | Lifecycle operations, information and health |

pub mod api;
