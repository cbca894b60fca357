// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod docker;
pub mod environment_factory;
pub mod event_bus;
pub mod fingerprint;
pub mod native;
pub mod watcher;

pub use environment_factory::{DefaultEnvironmentFactory, EnvironmentFactory};
pub use event_bus::EventBus;
