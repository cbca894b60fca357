// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! svcagent core
//!
//! Lifecycle agent for a single Python/Poetry service instance: dependency
//! installation guarded by content fingerprints, schema regeneration, a
//! supervised server process with hot reload, running natively or in a
//! container.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, lifecycle orchestration, execution backends and HTTP surface

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
