// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Application Layer (`svcagent-core`)
//!
//! Use cases driving a service instance through its lifecycle. Domain types
//! come from `crate::domain`; concrete backends from `crate::infrastructure`.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`lifecycle`] | `ServiceRuntime`: Load / Init / Start / Stop / Reset / Destroy / Test |
//! | [`supervisor`] | Zero-or-one supervised server process |
//! | [`reload`] | Debounced hot-reload restarts |

pub mod lifecycle;
pub mod reload;
pub mod supervisor;

pub use lifecycle::ServiceRuntime;
