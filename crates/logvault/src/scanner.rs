//! Recursive file scanner over a validated directory set
//!
//! # Design
//!
//! - Walk every directory of the set with the `ignore` parallel walker,
//!   bounded by the configured sub directory depth
//! - Each directory gets its own scoped thread; inside it the walker fans
//!   subdirectories out over its worker threads
//! - Missing or unreadable directories are logged and skipped, never fatal
//! - The same [`FileFilter`] decides relevance for the change watcher

use crate::exclusions::ExclusionList;
use crate::folders::DirectorySet;
use crate::types::{DirectoryType, SourceFile, SourceKind};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Instant;
use tracing::{debug, info, warn};
use ignore::{WalkBuilder, WalkState};

/// Extension and exclusion predicate shared by scanner and watcher
#[derive(Clone)]
pub struct FileFilter {
    extensions: BTreeMap<DirectoryType, BTreeSet<String>>,
    self_describing: BTreeSet<String>,
    exclusions: Arc<dyn ExclusionList>,
    suppress_mode: bool,
}

impl std::fmt::Debug for FileFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFilter")
            .field("extensions", &self.extensions)
            .field("self_describing", &self.self_describing)
            .field("suppress_mode", &self.suppress_mode)
            .finish()
    }
}

/// Why a file did not become a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVerdict {
    Workable(SourceKind),
    NonWorkable,
    Excluded,
}

impl FileFilter {
    pub fn new<I, S>(
        extensions: BTreeMap<DirectoryType, BTreeSet<String>>,
        self_describing: I,
        exclusions: Arc<dyn ExclusionList>,
        suppress_mode: bool,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions,
            self_describing: self_describing
                .into_iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
            exclusions,
            suppress_mode,
        }
    }

    pub fn kind_for_extension(&self, extension: &str) -> SourceKind {
        if self.self_describing.contains(extension) {
            SourceKind::SelfDescribing
        } else {
            SourceKind::ImportRaw
        }
    }

    /// Classify a file found in a directory of `directory_type`
    pub fn classify(&self, path: &Path, directory_type: DirectoryType) -> FileVerdict {
        let extension = lowercase_extension(path);
        let supported = self
            .extensions
            .get(&directory_type)
            .map_or(false, |set| set.contains(&extension));
        if !supported {
            return FileVerdict::NonWorkable;
        }
        if self.suppress_mode && self.exclusions.is_excluded(path, "") {
            return FileVerdict::Excluded;
        }
        FileVerdict::Workable(self.kind_for_extension(&extension))
    }

    /// True if `path` is workable for any active directory type
    pub fn accepts(&self, path: &Path) -> bool {
        self.extensions
            .keys()
            .any(|t| matches!(self.classify(path, *t), FileVerdict::Workable(_)))
    }

    pub fn suppress_mode(&self) -> bool {
        self.suppress_mode
    }

    pub fn exclusions(&self) -> &Arc<dyn ExclusionList> {
        &self.exclusions
    }
}

pub(crate) fn lowercase_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Result of a scan operation
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Unsorted candidates
    pub files: Vec<SourceFile>,
    pub non_workable_count: usize,
    pub excluded_count: usize,
    /// Errors encountered during scan
    pub errors: Vec<ScanError>,
}

/// Scan error details
#[derive(Debug, Clone)]
pub struct ScanError {
    pub path: PathBuf,
    pub message: String,
}

/// Depth-limited scanner over a [`DirectorySet`]
pub struct FileScanner {
    filter: FileFilter,
    sub_directory_level_max: usize,
    threads: usize,
}

impl FileScanner {
    /// `threads` is the walker thread count per directory; 0 lets the walker decide.
    pub fn new(filter: FileFilter, sub_directory_level_max: usize, threads: usize) -> Self {
        Self {
            filter,
            sub_directory_level_max,
            threads,
        }
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }

    /// Walk every directory of the set and classify the files found
    pub fn scan(&self, directories: &DirectorySet) -> ScanResult {
        let start = Instant::now();
        let roots: Vec<(DirectoryType, &PathBuf)> = directories.iter().collect();

        let partials: Vec<ScanResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = roots
                .iter()
                .map(|(directory_type, root)| {
                    let directory_type = *directory_type;
                    scope.spawn(move || self.scan_root(root, directory_type))
                })
                .collect();
            handles
                .into_iter()
                .zip(roots.iter())
                .map(|(handle, (_, root))| {
                    handle.join().unwrap_or_else(|_| ScanResult {
                        errors: vec![ScanError {
                            path: (*root).clone(),
                            message: "scan worker panicked".to_string(),
                        }],
                        ..ScanResult::default()
                    })
                })
                .collect()
        });

        // nested or doubly-typed directories may report a file twice
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut result = ScanResult::default();
        for partial in partials {
            result.absorb(partial, &mut seen);
        }

        info!(
            directories = roots.len(),
            files = result.files.len(),
            non_workable = result.non_workable_count,
            excluded = result.excluded_count,
            errors = result.errors.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Scan complete"
        );
        result
    }

    /// Parallel walk of one directory; each walker thread fills its own
    /// partial result and hands it over when the walk ends.
    fn scan_root(&self, root: &Path, directory_type: DirectoryType) -> ScanResult {
        if !root.is_dir() {
            debug!(path = %root.display(), "Skipping missing source directory");
            return ScanResult::default();
        }

        let walker = WalkBuilder::new(root)
            .threads(self.threads)
            .max_depth(Some(self.sub_directory_level_max + 1))
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .build_parallel();

        let (partial_tx, partial_rx) = mpsc::channel::<ScanResult>();
        walker.run(|| {
            let mut partial = PartialFlush {
                result: ScanResult::default(),
                tx: partial_tx.clone(),
            };
            Box::new(move |entry: Result<ignore::DirEntry, ignore::Error>| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = error_path(&e).unwrap_or_else(|| root.to_path_buf());
                        warn!(path = %path.display(), error = %e, "Skipping unreadable path");
                        partial.result.errors.push(ScanError {
                            path,
                            message: e.to_string(),
                        });
                        return WalkState::Continue;
                    }
                };
                if entry.depth() == 0 || entry.file_type().map_or(false, |t| t.is_dir()) {
                    return WalkState::Continue;
                }
                self.record(&mut partial.result, entry.into_path(), directory_type);
                WalkState::Continue
            })
        });
        drop(partial_tx);

        let mut seen = HashSet::new();
        let mut result = ScanResult::default();
        for partial in partial_rx {
            result.absorb(partial, &mut seen);
        }
        debug!(
            path = %root.display(),
            files = result.files.len(),
            "Directory walked"
        );
        result
    }

    fn record(&self, result: &mut ScanResult, path: PathBuf, directory_type: DirectoryType) {
        match self.filter.classify(&path, directory_type) {
            FileVerdict::Workable(kind) => {
                let extension = lowercase_extension(&path);
                result.files.push(SourceFile {
                    path,
                    directory_type,
                    extension,
                    kind,
                });
            }
            FileVerdict::NonWorkable => result.non_workable_count += 1,
            FileVerdict::Excluded => result.excluded_count += 1,
        }
    }
}

impl ScanResult {
    fn absorb(&mut self, other: ScanResult, seen: &mut HashSet<PathBuf>) {
        self.non_workable_count += other.non_workable_count;
        self.excluded_count += other.excluded_count;
        self.errors.extend(other.errors);
        for file in other.files {
            if seen.insert(file.path.clone()) {
                self.files.push(file);
            }
        }
    }
}

/// Sends a walker thread's partial result when the thread's visitor is dropped
struct PartialFlush {
    result: ScanResult,
    tx: mpsc::Sender<ScanResult>,
}

impl Drop for PartialFlush {
    fn drop(&mut self) {
        let result = std::mem::take(&mut self.result);
        let _ = self.tx.send(result);
    }
}

fn error_path(err: &ignore::Error) -> Option<PathBuf> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.clone()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        ignore::Error::Loop { child, .. } => Some(child.clone()),
        _ => None,
    }
}
