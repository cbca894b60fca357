// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the svcagent CLI

pub mod config;
pub mod reset;
pub mod run;
pub mod serve;

pub use self::config::ConfigCommand;
pub use self::reset::ResetArgs;
pub use self::run::RunArgs;
pub use self::serve::ServeArgs;
