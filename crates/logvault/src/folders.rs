//! Source directory resolution and change detection
//!
//! Each rebuild resolves the directories to scan for the active device and
//! object. The resolved [`DirectorySet`] is compared by value against the
//! previous cycle to decide whether files must be scanned again.

use crate::config::LogVaultConfig;
use crate::context::ActiveContext;
use crate::types::DirectoryType;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Status text shortens folder names beyond this length
const MAX_FOLDER_NAME_CHARS: usize = 22;

// ============================================================================
// DirectorySet
// ============================================================================

/// Resolved directories per directory type. Compared by content only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySet {
    dirs: BTreeMap<DirectoryType, BTreeSet<PathBuf>>,
}

impl DirectorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, directory_type: DirectoryType, path: impl Into<PathBuf>) {
        self.dirs.entry(directory_type).or_default().insert(path.into());
    }

    /// Register a type with no directories yet, so it still counts as active.
    pub fn activate(&mut self, directory_type: DirectoryType) {
        self.dirs.entry(directory_type).or_default();
    }

    pub fn paths(&self, directory_type: DirectoryType) -> impl Iterator<Item = &PathBuf> + '_ {
        self.dirs.get(&directory_type).into_iter().flatten()
    }

    pub fn directory_types(&self) -> impl Iterator<Item = DirectoryType> + '_ {
        self.dirs.keys().copied()
    }

    /// All directories with their type; a path listed under two types appears twice.
    pub fn iter(&self) -> impl Iterator<Item = (DirectoryType, &PathBuf)> + '_ {
        self.dirs
            .iter()
            .flat_map(|(t, paths)| paths.iter().map(move |p| (*t, p)))
    }

    pub fn all_paths(&self) -> BTreeSet<PathBuf> {
        self.dirs.values().flatten().cloned().collect()
    }

    /// Number of directories across all types
    pub fn len(&self) -> usize {
        self.dirs.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest number of path components `path` lies below any directory
    pub fn depth_below(&self, path: &Path) -> Option<usize> {
        self.dirs
            .values()
            .flatten()
            .filter_map(|dir| path.strip_prefix(dir).ok())
            .map(|rel| rel.components().count())
            .min()
    }

    /// True if `file` lies inside one of the directories within `max_depth`
    /// sub directory levels.
    pub fn is_matching_path(&self, file: &Path, max_depth: usize) -> bool {
        self.depth_below(file)
            .map_or(false, |depth| depth >= 1 && depth <= max_depth + 1)
    }

    /// Comma separated list, each path prefixed by its directory type
    pub fn decorated_paths_csv(&self) -> String {
        self.iter()
            .map(|(t, p)| format!("{}: {}", t, p.display()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Comma separated list of the folder names, shortened for status lines
    pub fn truncated_names_csv(&self) -> String {
        self.all_paths()
            .iter()
            .map(|p| {
                let name = p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| p.display().to_string());
                if name.chars().count() > MAX_FOLDER_NAME_CHARS {
                    let head: String = name.chars().take(MAX_FOLDER_NAME_CHARS - 1).collect();
                    format!("{}…", head)
                } else {
                    name
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromIterator<(DirectoryType, PathBuf)> for DirectorySet {
    fn from_iter<I: IntoIterator<Item = (DirectoryType, PathBuf)>>(iter: I) -> Self {
        let mut set = DirectorySet::new();
        for (t, p) in iter {
            set.insert(t, p);
        }
        set
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Result of one directory validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub directories: DirectorySet,
    /// Supported extensions per active directory type
    pub extensions: BTreeMap<DirectoryType, BTreeSet<String>>,
    /// False when device, channel mix, object and directories are unchanged
    pub changed: bool,
    /// Only the channel differs from the previous cycle; the file list may be reused
    pub channel_change_only: bool,
    pub slow_folder_access: bool,
}

/// What the previous validation was computed for
#[derive(Debug, Clone, PartialEq, Eq)]
struct ValidationKey {
    device_name: String,
    channel_number: u32,
    channel_mix: BTreeSet<u32>,
    object_key: String,
    directories: DirectorySet,
    extensions: BTreeMap<DirectoryType, BTreeSet<String>>,
}

/// Computes the directory set per cycle and detects changes
#[derive(Debug)]
pub struct DirectoryResolver {
    data_dir: PathBuf,
    data_folders: Vec<PathBuf>,
    import_folders: Vec<PathBuf>,
    search_data_path_imports: bool,
    sub_directory_level_max: usize,
    self_describing_extensions: BTreeSet<String>,
    slow_folder_threshold: Duration,
    previous: Option<ValidationKey>,
}

impl DirectoryResolver {
    pub fn new(config: &LogVaultConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            data_folders: config.data_folders.clone(),
            import_folders: config.import_folders.clone(),
            search_data_path_imports: config.search_data_path_imports,
            sub_directory_level_max: config.sub_directory_level_max,
            self_describing_extensions: config
                .self_describing_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            slow_folder_threshold: config.slow_folder_threshold(),
            previous: None,
        }
    }

    /// Forget the previous cycle; the next validation reports a change.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Supported extensions per active directory type
    pub fn extensions(&self, ctx: &ActiveContext) -> BTreeMap<DirectoryType, BTreeSet<String>> {
        let mut extensions = BTreeMap::new();

        let mut data = self.self_describing_extensions.clone();
        if self.search_data_path_imports {
            data.extend(ctx.device.import_extensions.iter().cloned());
        }
        extensions.insert(DirectoryType::Data, data);

        if self.is_import_active(ctx) {
            extensions.insert(DirectoryType::Import, ctx.device.import_extensions.clone());
        }
        extensions
    }

    fn is_import_active(&self, ctx: &ActiveContext) -> bool {
        !ctx.device.import_extensions.is_empty() && !self.import_folders.is_empty()
    }

    /// Resolve the directory set without touching the change state
    pub fn resolve(&self, ctx: &ActiveContext) -> DirectorySet {
        let mut set = DirectorySet::new();

        set.activate(DirectoryType::Data);
        let device_dir = self.data_dir.join(ctx.device.pure_name());
        if ctx.has_object_key() {
            let mut bases = vec![self.data_dir.clone()];
            bases.extend(self.data_folders.iter().cloned());
            for dir in self.object_paths(&bases, &ctx.object_key) {
                set.insert(DirectoryType::Data, dir);
            }
        } else {
            set.insert(DirectoryType::Data, device_dir);
            for dir in &self.data_folders {
                set.insert(DirectoryType::Data, dir.clone());
            }
        }

        if self.is_import_active(ctx) {
            set.activate(DirectoryType::Import);
            if ctx.has_object_key() {
                for dir in self.object_paths(&self.import_folders, &ctx.object_key) {
                    set.insert(DirectoryType::Import, dir);
                }
            }
            // without object paths the import folders are scanned as-is
            if set.paths(DirectoryType::Import).next().is_none() {
                for dir in &self.import_folders {
                    set.insert(DirectoryType::Import, dir.clone());
                }
            }
        }

        set
    }

    /// Directories below `bases` whose folder name equals `object_key`, ignoring case
    fn object_paths(&self, bases: &[PathBuf], object_key: &str) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        for base in bases {
            if !base.is_dir() {
                debug!(path = %base.display(), "Object search base is not a directory");
                continue;
            }
            let walker = WalkDir::new(base)
                .min_depth(1)
                .max_depth(self.sub_directory_level_max + 1)
                .follow_links(false);
            for entry in walker {
                match entry {
                    Ok(entry) if entry.file_type().is_dir() => {
                        let matches = entry
                            .file_name()
                            .to_str()
                            .map_or(false, |name| name.eq_ignore_ascii_case(object_key));
                        if matches {
                            found.insert(entry.into_path());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(base = %base.display(), error = %e, "Skipping unreadable entry");
                    }
                }
            }
        }
        found
    }

    /// Resolve directories and compare against the previous cycle.
    pub fn validate(&mut self, ctx: &ActiveContext) -> Validation {
        let start = Instant::now();
        let directories = self.resolve(ctx);
        let elapsed = start.elapsed();

        let folder_count = directories.len().max(1) as u32;
        let slow_folder_access = elapsed / folder_count > self.slow_folder_threshold;
        if slow_folder_access {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                folders = directories.len(),
                "Slow folder access"
            );
        }

        let extensions = self.extensions(ctx);
        let key = ValidationKey {
            device_name: ctx.device.name.clone(),
            channel_number: ctx.channel_number,
            channel_mix: ctx.channel_mix_numbers(),
            object_key: ctx.object_key.clone(),
            directories: directories.clone(),
            extensions: extensions.clone(),
        };

        let (changed, channel_change_only) = match &self.previous {
            None => (true, false),
            Some(prev) if *prev == key => (false, false),
            Some(prev) => {
                let only_channel = prev.device_name == key.device_name
                    && prev.object_key == key.object_key
                    && prev.directories == key.directories
                    && prev.extensions == key.extensions;
                (true, only_channel)
            }
        };

        if changed {
            info!(
                directories = %directories.decorated_paths_csv(),
                channel_change_only,
                "Source directories changed"
            );
        }

        self.previous = Some(key);

        Validation {
            directories,
            extensions,
            changed,
            channel_change_only,
            slow_folder_access,
        }
    }
}
