//! Core types for the vault pipeline
//!
//! A scan produces [`SourceFile`]s, the extractor turns them into [`Truss`]
//! skeletons, and the parser (or the cache) promotes trusses to [`Vault`]s.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Directory & Source Kinds
// ============================================================================

/// Category of a source directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryType {
    /// Primary data directory plus configured data folders
    Data,
    /// Configured import folders holding raw device logs
    Import,
}

impl DirectoryType {
    pub const ALL: [DirectoryType; 2] = [DirectoryType::Data, DirectoryType::Import];

    pub fn as_str(&self) -> &'static str {
        match self {
            DirectoryType::Data => "data",
            DirectoryType::Import => "import",
        }
    }
}

impl fmt::Display for DirectoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a source file yields trusses. Capabilities live in `source.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Self-contained recordset container with a readable header
    SelfDescribing,
    /// Raw device log that needs the device parser for anything but a placeholder
    ImportRaw,
}

// ============================================================================
// Scanned Files
// ============================================================================

/// A candidate file found by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub directory_type: DirectoryType,
    /// Lowercase extension without the dot
    pub extension: String,
    pub kind: SourceKind,
}

// ============================================================================
// Trusses & Vaults
// ============================================================================

/// Identity used for duplicate detection and cache consistency checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VaultIdentity {
    pub start_timestamp_ms: i64,
    pub recordset_ordinal: u32,
    pub channel_number: u32,
    pub resolved_path: PathBuf,
}

/// Lightweight vault skeleton carrying everything the criteria filter needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truss {
    pub device_name: String,
    pub channel_number: u32,
    /// Empty when the source carries no object tagging
    pub object_key: String,
    pub start_timestamp_ms: i64,
    pub recordset_ordinal: u32,
    pub recordset_base_name: String,
    /// Path as found by the scanner (the link file for indirections)
    pub source_path: PathBuf,
    /// Physical data file
    pub resolved_path: PathBuf,
    /// Set when `source_path` is an indirection to `resolved_path`
    pub link_path: Option<PathBuf>,
    /// Enclosing folder name unless that folder is the device folder
    pub object_directory: String,
    pub file_size: u64,
    pub file_modified_ms: i64,
    pub kind: SourceKind,
    /// False for skeletons, true once parsed
    pub complete: bool,
}

impl Truss {
    pub fn identity(&self) -> VaultIdentity {
        VaultIdentity {
            start_timestamp_ms: self.start_timestamp_ms,
            recordset_ordinal: self.recordset_ordinal,
            channel_number: self.channel_number,
            resolved_path: self.resolved_path.clone(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_path(&self.resolved_path)
    }

    /// File name of the physical data file
    pub fn file_name(&self) -> String {
        self.resolved_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Fully parsed recordset descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vault {
    pub truss: Truss,
    /// Parsed measurement statistics, e.g. `altitude.max`
    pub metrics: BTreeMap<String, f64>,
    /// Derived integer scores, e.g. `samples`
    pub scores: BTreeMap<String, i64>,
    /// Cache bookkeeping; excluded from content comparison
    pub vault_created_ms: i64,
}

impl Vault {
    /// Promote a truss. The vault takes the truss fields as its descriptor.
    pub fn from_truss(mut truss: Truss) -> Self {
        truss.complete = true;
        Self {
            truss,
            metrics: BTreeMap::new(),
            scores: BTreeMap::new(),
            vault_created_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn identity(&self) -> VaultIdentity {
        self.truss.identity()
    }

    pub fn start_timestamp_ms(&self) -> i64 {
        self.truss.start_timestamp_ms
    }

    pub fn file_size(&self) -> u64 {
        self.truss.file_size
    }

    /// Field equality ignoring cache bookkeeping
    pub fn same_content(&self, other: &Vault) -> bool {
        self.truss == other.truss && self.metrics == other.metrics && self.scores == other.scores
    }
}

// ============================================================================
// Cache Keys
// ============================================================================

/// Groups all trusses of one physical file into one parse job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derived from the lexically normalized resolved path, so `a/x/../b` and `a/b` agree.
    pub fn from_path(resolved: &Path) -> Self {
        let normalized = normalize_path(resolved);
        CacheKey(blake3::hash(normalized.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..16.min(self.0.len())])
    }
}

/// Forward-slash path string with `.` and `..` components folded lexically
pub fn normalize_path(path: &Path) -> String {
    use std::path::Component;
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for component in path.components() {
        match component {
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => {
                match parts.last().map(String::as_str) {
                    Some("..") | None if !absolute => parts.push("..".to_string()),
                    Some(_) => {
                        parts.pop();
                    }
                    None => {}
                }
            }
            Component::Prefix(p) => parts.push(p.as_os_str().to_string_lossy().into_owned()),
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

// ============================================================================
// Picked Vaults
// ============================================================================

/// Timestamp-sorted multimap, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PickedVaults {
    map: BTreeMap<Reverse<i64>, Vec<Vault>>,
}

impl PickedVaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vault: Vault) {
        self.map
            .entry(Reverse(vault.start_timestamp_ms()))
            .or_default()
            .push(vault);
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Remove and return every vault matching `remove`; emptied timestamps are dropped.
    pub fn remove_where<F: FnMut(&Vault) -> bool>(&mut self, mut remove: F) -> Vec<Vault> {
        let mut removed = Vec::new();
        for vaults in self.map.values_mut() {
            let (gone, kept): (Vec<Vault>, Vec<Vault>) =
                std::mem::take(vaults).into_iter().partition(|v| remove(v));
            *vaults = kept;
            removed.extend(gone);
        }
        self.map.retain(|_, vaults| !vaults.is_empty());
        removed
    }

    /// Number of distinct timestamps
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of vaults across all timestamps
    pub fn vault_count(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn get(&self, start_timestamp_ms: i64) -> Option<&[Vault]> {
        self.map.get(&Reverse(start_timestamp_ms)).map(Vec::as_slice)
    }

    /// Timestamps, newest first
    pub fn timestamps(&self) -> impl Iterator<Item = i64> + '_ {
        self.map.keys().map(|k| k.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &[Vault])> + '_ {
        self.map.iter().map(|(k, v)| (k.0, v.as_slice()))
    }

    pub fn vaults(&self) -> impl Iterator<Item = &Vault> + '_ {
        self.map.values().flatten()
    }

    /// Order-independent comparison of content, used for idempotence checks
    pub fn same_content(&self, other: &PickedVaults) -> bool {
        if self.len() != other.len() || self.vault_count() != other.vault_count() {
            return false;
        }
        self.map.iter().all(|(ts, vaults)| {
            other.map.get(ts).map_or(false, |theirs| {
                let mut mine: Vec<&Vault> = vaults.iter().collect();
                let mut others: Vec<&Vault> = theirs.iter().collect();
                mine.sort_by_key(|v| v.identity());
                others.sort_by_key(|v| v.identity());
                mine.iter().zip(others.iter()).all(|(a, b)| a.same_content(b))
            })
        })
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters collected during one rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatistics {
    /// Directories in the validated set
    pub directories: usize,
    /// Candidate files with a supported extension
    pub files_matched: usize,
    pub files_non_workable: usize,
    pub files_excluded: usize,
    pub trusses_extracted: usize,
    pub trusses_rejected: usize,
    pub duplicates_suppressed: usize,
    pub cache_hits: usize,
    pub vaults_parsed: usize,
    pub parse_failures: usize,
    pub vaults_excluded: usize,
    /// Sum of physical file sizes of picked vaults
    pub bytes: u64,
    pub elapsed_ms: u64,
}
