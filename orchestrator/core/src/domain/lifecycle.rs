// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime Lifecycle State Machine
//!
//! ```text
//! Unloaded ──load──▶ Loaded ──init──▶ Initialized ──start──▶ Running
//!                      ▲  ▲              │  ▲                   │
//!                      │  └────reset─────┘  └──init── Stopped ◀─stop
//!                      └──────────reset──────────────────┘
//! ```
//!
//! | Operation | Allowed from | Ends in |
//! |-----------|--------------|---------|
//! | Load | Unloaded, Loaded | Loaded |
//! | Init | Loaded, Initialized, Stopped | Initialized |
//! | Start | Initialized, Stopped, Running (hot reload) | Running |
//! | Stop | any | Stopped (or unchanged before Init) |
//! | Reset | Loaded, Initialized, Stopped | Loaded |
//! | Destroy | Loaded, Initialized, Stopped | Unloaded |
//! | Test | Initialized, Running, Stopped | unchanged |
//!
//! Anything else is a driver bug and fails with `InvalidTransition`.

use crate::domain::network::NetworkError;
use crate::domain::runtime::RuntimeError;
use crate::domain::service::ServiceError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Initialized,
    Running,
    Stopped,
}

/// Lifecycle operation that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Load,
    Init,
    Start,
    Stop,
    Reset,
    Destroy,
    Test,
    Reload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Load => "load",
            Phase::Init => "init",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Reset => "reset",
            Phase::Destroy => "destroy",
            Phase::Test => "test",
            Phase::Reload => "reload",
        };
        f.write_str(s)
    }
}

impl LifecycleState {
    /// Check whether `phase` may run from this state
    pub fn allows(&self, phase: Phase) -> bool {
        use LifecycleState::*;
        match phase {
            Phase::Load => matches!(self, Unloaded | Loaded),
            Phase::Init => matches!(self, Loaded | Initialized | Stopped),
            Phase::Start => matches!(self, Initialized | Stopped | Running),
            Phase::Stop => true,
            Phase::Reset | Phase::Destroy => matches!(self, Loaded | Initialized | Stopped),
            Phase::Test => matches!(self, Initialized | Running | Stopped),
            Phase::Reload => matches!(self, Running),
        }
    }

    pub fn ensure(&self, phase: Phase) -> Result<(), AgentError> {
        if self.allows(phase) {
            Ok(())
        } else {
            Err(AgentError::InvalidTransition { phase, from: *self })
        }
    }
}

/// Errors returned by lifecycle operations.
///
/// Every variant names the phase that failed so the orchestrator can report
/// it without extra bookkeeping.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing manifest, missing endpoint, bad identity. Not retryable.
    #[error("[{phase}] configuration error: {message}")]
    Configuration { phase: Phase, message: String },

    /// No usable network mapping. Retryable with corrected mappings.
    #[error("[{phase}] network resolution failed: {source}")]
    Resolution {
        phase: Phase,
        #[source]
        source: NetworkError,
    },

    /// An external command exited non-zero
    #[error("[{phase}] command `{command}` failed with exit code {exit_code:?}\n{output}")]
    Command {
        phase: Phase,
        command: String,
        exit_code: Option<i64>,
        output: String,
    },

    #[error("[{phase}] execution environment error: {source}")]
    Environment {
        phase: Phase,
        #[source]
        source: RuntimeError,
    },

    #[error("[{phase}] not allowed while {from:?}")]
    InvalidTransition { phase: Phase, from: LifecycleState },

    /// Every teardown step that failed, in execution order
    #[error("[{phase}] teardown failed: {}", errors.join("; "))]
    Teardown { phase: Phase, errors: Vec<String> },

    #[error("[{phase}] cancelled")]
    Cancelled { phase: Phase },
}

impl AgentError {
    pub fn phase(&self) -> Phase {
        match self {
            AgentError::Configuration { phase, .. }
            | AgentError::Resolution { phase, .. }
            | AgentError::Command { phase, .. }
            | AgentError::Environment { phase, .. }
            | AgentError::InvalidTransition { phase, .. }
            | AgentError::Teardown { phase, .. }
            | AgentError::Cancelled { phase } => *phase,
        }
    }

    pub fn configuration(phase: Phase, message: impl Into<String>) -> Self {
        AgentError::Configuration { phase, message: message.into() }
    }

    pub fn environment(phase: Phase, source: RuntimeError) -> Self {
        match source {
            RuntimeError::Cancelled => AgentError::Cancelled { phase },
            source => AgentError::Environment { phase, source },
        }
    }

    pub fn service(phase: Phase, source: ServiceError) -> Self {
        AgentError::Configuration { phase, message: source.to_string() }
    }

    /// Whether retrying with different inputs can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Resolution { .. } | AgentError::Command { .. } | AgentError::Cancelled { .. }
        )
    }
}
