// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fingerprint Cache
//!
//! Content fingerprints over named dependency sets, used to skip redundant
//! installer and schema-generation runs.
//!
//! A fingerprint is a SHA-256 over the sorted `(relative path, contents)`
//! pairs selected by the set's patterns. Literal paths that do not exist
//! contribute an "absent" marker so creating them later changes the hash.
//! Modification times and ownership are never read.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Persist one `<name>.fingerprint` file per set under a scope-specific cache root

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

const FINGERPRINT_EXTENSION: &str = "fingerprint";
const ABSENT_MARKER: &[u8] = b"\0<absent>\0";

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Invalid selection pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to write fingerprint {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// A named group of files and directories whose content drives one
/// expensive step (dependency install, schema generation)
#[derive(Debug, Clone)]
pub struct DependencySet {
    pub name: String,
    pub root: PathBuf,
    /// Literal paths or glob patterns, relative to `root`
    pub patterns: Vec<String>,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || name == "__pycache__" || name == "node_modules"
}

impl DependencySet {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), root: root.into(), patterns: vec![] }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn with_patterns(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.patterns.extend(patterns);
        self
    }

    fn glob_set(&self) -> Result<Option<GlobSet>, FingerprintError> {
        let globs: Vec<&String> = self.patterns.iter().filter(|p| is_glob(p)).collect();
        if globs.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in globs {
            let glob = Glob::new(pattern).map_err(|e| FingerprintError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map(Some)
            .map_err(|e| FingerprintError::InvalidPattern { pattern: self.patterns.join(","), reason: e.to_string() })
    }

    fn walk_files(&self, dir: &Path, into: &mut Vec<PathBuf>) {
        let walker = WalkDir::new(dir).follow_links(false).into_iter().filter_entry(|e| {
            e.depth() == 0 || !e.file_type().is_dir() || !skip_dir(&e.file_name().to_string_lossy())
        });
        for entry in walker.flatten() {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    into.push(rel.to_path_buf());
                }
            }
        }
    }

    /// Relative paths selected by the patterns, plus literal paths that are missing
    fn select(&self) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FingerprintError> {
        let mut present = Vec::new();
        let mut absent = Vec::new();

        for literal in self.patterns.iter().filter(|p| !is_glob(p)) {
            let full = self.root.join(literal);
            if full.is_dir() {
                self.walk_files(&full, &mut present);
            } else if full.is_file() {
                present.push(PathBuf::from(literal));
            } else {
                absent.push(PathBuf::from(literal));
            }
        }

        if let Some(globs) = self.glob_set()? {
            let mut candidates = Vec::new();
            self.walk_files(&self.root, &mut candidates);
            present.extend(candidates.into_iter().filter(|rel| globs.is_match(rel)));
        }

        present.sort();
        present.dedup();
        absent.sort();
        Ok((present, absent))
    }

    /// Hex SHA-256 of the selected content
    pub fn fingerprint(&self) -> Result<String, FingerprintError> {
        let (present, absent) = self.select()?;
        let mut hasher = Sha256::new();
        for rel in &present {
            let full = self.root.join(rel);
            let content = std::fs::read(&full)
                .map_err(|e| FingerprintError::Read { path: full.clone(), reason: e.to_string() })?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(&content);
            hasher.update(b"\0");
        }
        for rel in &absent {
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(ABSENT_MARKER);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStatus {
    /// No record for this set
    Missing,
    /// Record differs from the current content
    Changed,
    Fresh,
}

impl FingerprintStatus {
    pub fn is_stale(&self) -> bool {
        !matches!(self, FingerprintStatus::Fresh)
    }
}

/// Persisted fingerprints for one execution scope
#[derive(Debug, Clone)]
pub struct FingerprintCache {
    root: PathBuf,
}

impl FingerprintCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, set: &DependencySet) -> PathBuf {
        self.root.join(format!("{}.{}", set.name, FINGERPRINT_EXTENSION))
    }

    /// Compare the set's content against the stored record.
    ///
    /// Any read failure is reported as stale.
    pub fn status(&self, set: &DependencySet) -> FingerprintStatus {
        let path = self.record_path(set);
        let stored = match std::fs::read_to_string(&path) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FingerprintStatus::Missing,
            Err(e) => {
                warn!("Cannot read fingerprint {:?}: {}. Treating as stale", path, e);
                return FingerprintStatus::Changed;
            }
        };
        match set.fingerprint() {
            Ok(current) if current == stored => FingerprintStatus::Fresh,
            Ok(_) => FingerprintStatus::Changed,
            Err(e) => {
                warn!("Cannot fingerprint '{}': {}. Treating as stale", set.name, e);
                FingerprintStatus::Changed
            }
        }
    }

    /// `true` when no record exists or the content changed
    pub fn updated(&self, set: &DependencySet) -> bool {
        self.status(set).is_stale()
    }

    /// Persist the current fingerprint of `set`
    pub fn update_cache(&self, set: &DependencySet) -> Result<(), FingerprintError> {
        let path = self.record_path(set);
        let fingerprint = set.fingerprint()?;
        std::fs::create_dir_all(&self.root)
            .map_err(|e| FingerprintError::Write { path: path.clone(), reason: e.to_string() })?;
        std::fs::write(&path, &fingerprint)
            .map_err(|e| FingerprintError::Write { path: path.clone(), reason: e.to_string() })?;
        debug!(set = %set.name, fingerprint = %fingerprint, "Fingerprint updated");
        Ok(())
    }

    /// Remove every record, and anything else stored under the cache root
    pub fn clear(&self) -> Result<(), FingerprintError> {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(FingerprintError::Write { path: self.root.clone(), reason: e.to_string() });
            }
        }
        std::fs::create_dir_all(&self.root)
            .map_err(|e| FingerprintError::Write { path: self.root.clone(), reason: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_then_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pyproject.toml"), "[tool.poetry]\nname = \"a\"\n").unwrap();
        let set = DependencySet::new("poetry", dir.path()).with_pattern("pyproject.toml");
        let cache = FingerprintCache::new(dir.path().join(".cache/local"));

        assert_eq!(cache.status(&set), FingerprintStatus::Missing);
        cache.update_cache(&set).unwrap();
        assert_eq!(cache.status(&set), FingerprintStatus::Fresh);
        assert!(!cache.updated(&set));
    }

    #[test]
    fn test_absent_literal_changes_when_created() {
        let dir = tempfile::tempdir().unwrap();
        let set = DependencySet::new("poetry", dir.path()).with_pattern("poetry.lock");
        let before = set.fingerprint().unwrap();
        std::fs::write(dir.path().join("poetry.lock"), "").unwrap();
        assert_ne!(before, set.fingerprint().unwrap());
    }

    #[test]
    fn test_glob_selection_ignores_unselected_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg")).unwrap();
        std::fs::write(dir.path().join("pkg/a.toml"), "a").unwrap();
        let set = DependencySet::new("cfg", dir.path()).with_pattern("**/*.toml");
        let before = set.fingerprint().unwrap();

        std::fs::write(dir.path().join("pkg/readme.md"), "docs").unwrap();
        assert_eq!(before, set.fingerprint().unwrap());

        std::fs::write(dir.path().join("pkg/b.toml"), "b").unwrap();
        assert_ne!(before, set.fingerprint().unwrap());
    }

    #[test]
    fn test_unreadable_record_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "app = 1").unwrap();
        let set = DependencySet::new("api", dir.path()).with_pattern("main.py");
        let cache = FingerprintCache::new(dir.path().join("cache"));
        // A directory where the record file should be
        std::fs::create_dir_all(dir.path().join("cache/api.fingerprint")).unwrap();
        assert!(cache.updated(&set));
    }

    #[test]
    fn test_clear_removes_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "app = 1").unwrap();
        let set = DependencySet::new("api", dir.path()).with_pattern("main.py");
        let cache = FingerprintCache::new(dir.path().join("cache"));
        cache.update_cache(&set).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.status(&set), FingerprintStatus::Missing);
        assert!(cache.root().exists());
    }
}
