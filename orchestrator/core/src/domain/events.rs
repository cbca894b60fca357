// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::lifecycle::Phase;
use crate::domain::runtime::ExecutionScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which dependency step ran during Init or a hot-reload restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallVerb {
    Install,
    Update,
}

/// Events published by the service runtime on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Loaded {
        service: String,
        endpoints: usize,
        loaded_at: DateTime<Utc>,
    },
    Initialized {
        service: String,
        scope: ExecutionScope,
        address: String,
        initialized_at: DateTime<Utc>,
    },
    DependenciesInstalled {
        service: String,
        scope: ExecutionScope,
        verb: InstallVerb,
        duration_ms: u64,
        installed_at: DateTime<Utc>,
    },
    SchemaGenerated {
        service: String,
        scope: ExecutionScope,
        generated_at: DateTime<Utc>,
    },
    Started {
        service: String,
        scope: ExecutionScope,
        process_id: String,
        started_at: DateTime<Utc>,
    },
    RestartRequested {
        service: String,
        changed_paths: Vec<String>,
        requested_at: DateTime<Utc>,
    },
    Restarted {
        service: String,
        process_id: String,
        restarted_at: DateTime<Utc>,
    },
    Stopped {
        service: String,
        stopped_at: DateTime<Utc>,
    },
    Reset {
        service: String,
        reset_at: DateTime<Utc>,
    },
    Destroyed {
        service: String,
        destroyed_at: DateTime<Utc>,
    },
    OperationFailed {
        service: String,
        phase: Phase,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn service(&self) -> &str {
        match self {
            LifecycleEvent::Loaded { service, .. }
            | LifecycleEvent::Initialized { service, .. }
            | LifecycleEvent::DependenciesInstalled { service, .. }
            | LifecycleEvent::SchemaGenerated { service, .. }
            | LifecycleEvent::Started { service, .. }
            | LifecycleEvent::RestartRequested { service, .. }
            | LifecycleEvent::Restarted { service, .. }
            | LifecycleEvent::Stopped { service, .. }
            | LifecycleEvent::Reset { service, .. }
            | LifecycleEvent::Destroyed { service, .. }
            | LifecycleEvent::OperationFailed { service, .. } => service,
        }
    }
}
