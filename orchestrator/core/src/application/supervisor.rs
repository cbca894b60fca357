// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Supervisor
//!
//! Owns the zero-or-one long-running service process of a runtime.
//!
//! ## Start Decision Table
//! | Current process | Hot reload | Action |
//! |-----------------|-----------|--------|
//! | none / exited | any | spawn |
//! | running | on | no-op (the server reloads itself) |
//! | running | off | `AlreadyRunning` |
//!
//! Stop with nothing running succeeds. There is no restart-on-crash policy:
//! an exited process is only noticed on the next start or liveness check.

use crate::domain::requests::TestResult;
use crate::domain::runtime::{
    ExecutionEnvironment, OutputSink, ProcessHandle, ProcessSpec, RuntimeError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(String),
    AlreadyRunning(String),
}

pub struct ProcessSupervisor {
    current: Option<Box<dyn ProcessHandle>>,
    hot_reload: bool,
    grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(hot_reload: bool, grace: Duration) -> Self {
        Self { current: None, hot_reload, grace }
    }

    pub fn process_id(&self) -> Option<String> {
        self.current.as_ref().map(|p| p.id())
    }

    pub async fn is_running(&self) -> bool {
        match &self.current {
            Some(process) => process.is_running().await,
            None => false,
        }
    }

    pub async fn start(
        &mut self,
        environment: &dyn ExecutionEnvironment,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
    ) -> Result<StartOutcome, RuntimeError> {
        if let Some(mut existing) = self.current.take() {
            if existing.is_running().await {
                let id = existing.id();
                self.current = Some(existing);
                if self.hot_reload {
                    debug!("Process {} already running with hot reload, nothing to do", id);
                    return Ok(StartOutcome::AlreadyRunning(id));
                }
                return Err(RuntimeError::AlreadyRunning(id));
            }
            warn!("Previous process {} exited on its own, replacing it", existing.id());
            existing.terminate(self.grace).await?;
        }

        let process = environment.spawn(spec, output).await?;
        let id = process.id();
        info!("Supervising process {}", id);
        self.current = Some(process);
        Ok(StartOutcome::Started(id))
    }

    /// Terminate the current process. Returns whether there was one.
    pub async fn stop(&mut self) -> Result<bool, RuntimeError> {
        let Some(mut process) = self.current.take() else {
            debug!("Stop requested with no supervised process");
            return Ok(false);
        };
        let id = process.id();
        info!("Stopping process {}", id);
        // The handle is dropped even when terminate fails; its Drop kills what is left
        process.terminate(self.grace).await?;
        Ok(true)
    }

    /// Run the test command to completion and report pass/fail
    pub async fn test(
        &self,
        environment: &dyn ExecutionEnvironment,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<TestResult, RuntimeError> {
        info!("Running tests: {}", spec.command_line());
        let result = environment.run(spec, output, cancel).await?;
        let passed = result.success();
        info!("Tests {} (exit code {:?})", if passed { "passed" } else { "failed" }, result.exit_code);
        Ok(TestResult { passed, exit_code: result.exit_code, output: result.lines })
    }
}
