// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Change Events & Filtering
//!
//! Decides which filesystem changes under the service root should restart
//! the service process.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure path classification, no filesystem access

use crate::domain::agent_config::{HotReloadConfig, SchemaConfig};
use std::path::{Path, PathBuf};

/// A filesystem path that changed, relative to the watched root when possible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Path classification for hot reload
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    /// Path components that are never relevant (cache dirs, schema output dir)
    ignored_components: Vec<String>,
    /// File names written by the schema generator
    ignored_files: Vec<String>,
    /// Extensions the server reloads on its own
    delegated_extensions: Vec<String>,
}

impl ChangeFilter {
    pub fn new(
        ignored_components: Vec<String>,
        ignored_files: Vec<String>,
        delegated_extensions: Vec<String>,
    ) -> Self {
        Self { ignored_components, ignored_files, delegated_extensions }
    }

    pub fn from_config(hot_reload: &HotReloadConfig, schema: &SchemaConfig) -> Self {
        let mut components = hot_reload.ignore.clone();
        components.push(schema.artifact_dir.clone());
        Self::new(components, schema.artifacts.clone(), hot_reload.delegated_extensions.clone())
    }

    /// `true` when a change to `path` should trigger a restart
    pub fn should_restart(&self, path: &Path) -> bool {
        let ignored_component = path.components().any(|c| {
            let c = c.as_os_str().to_string_lossy();
            self.ignored_components.iter().any(|i| *i == c)
        });
        if ignored_component {
            return false;
        }

        if let Some(name) = path.file_name().map(|n| n.to_string_lossy()) {
            if self.ignored_files.iter().any(|f| *f == name) {
                return false;
            }
        }

        match path.extension().map(|e| e.to_string_lossy()) {
            Some(ext) => !self.delegated_extensions.iter().any(|d| *d == ext),
            None => true,
        }
    }

    /// Keep only the events that should restart the service
    pub fn filter(&self, events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
        events.into_iter().filter(|e| self.should_restart(&e.path)).collect()
    }
}
