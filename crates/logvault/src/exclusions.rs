//! Exclusion list lookups
//!
//! The pipeline only queries exclusions; persisting them is up to the host.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub trait ExclusionList: Send + Sync {
    /// An empty `recordset_base_name` asks whether the whole file is excluded.
    fn is_excluded(&self, path: &Path, recordset_base_name: &str) -> bool;
}

/// Excludes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExclusions;

impl ExclusionList for NoExclusions {
    fn is_excluded(&self, _path: &Path, _recordset_base_name: &str) -> bool {
        false
    }
}

/// In-memory exclusion list, editable between rebuilds
#[derive(Debug, Default)]
pub struct ExclusionSet {
    // empty set = whole file
    entries: RwLock<HashMap<PathBuf, BTreeSet<String>>>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_file(&self, path: impl Into<PathBuf>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(path.into(), BTreeSet::new());
        }
    }

    pub fn exclude_recordset(&self, path: impl Into<PathBuf>, recordset_base_name: &str) {
        if let Ok(mut entries) = self.entries.write() {
            let names = entries.entry(path.into()).or_default();
            names.insert(recordset_base_name.to_string());
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(path);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExclusionList for ExclusionSet {
    fn is_excluded(&self, path: &Path, recordset_base_name: &str) -> bool {
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        match entries.get(path) {
            None => false,
            Some(names) if names.is_empty() => true,
            Some(names) => !recordset_base_name.is_empty() && names.contains(recordset_base_name),
        }
    }
}
