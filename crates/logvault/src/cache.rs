//! Vault Cache - parsed vaults persisted per recordset
//!
//! Layout: `<cache_dir>/<scope>/<vault name>.bin`. The scope hash covers
//! everything that changes how a file parses (crate version, device,
//! channel, parser settings), so switching any of them opens a different
//! directory instead of serving stale entries. The vault name hashes the
//! physical file's folder, name, modification time, size and recordset
//! ordinal.
//!
//! Entries are bincode-encoded with a version header and written atomically
//! (temp file + rename). Writes are best-effort.

use crate::jobs::TrussJobs;
use crate::progress::ProgressManager;
use crate::types::{Truss, Vault};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Cache format version - bump when format changes
const CACHE_VERSION: u32 = 1;

const ENTRY_EXTENSION: &str = "bin";

/// Inputs that change the parse result of a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    pub device_name: String,
    pub channel_number: u32,
    /// Free-form parser settings fingerprint
    pub settings: String,
}

impl CacheScope {
    pub fn directory_name(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
        hasher.update(&CACHE_VERSION.to_le_bytes());
        hasher.update(self.device_name.as_bytes());
        hasher.update(&self.channel_number.to_le_bytes());
        hasher.update(self.settings.as_bytes());
        hasher.finalize().to_hex()[..32].to_string()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedVault {
    version: u32,
    vault: Vault,
}

/// Persistent lookup of parsed vaults
#[derive(Debug, Clone)]
pub struct VaultCache {
    dir: PathBuf,
}

impl VaultCache {
    pub fn new(cache_dir: &Path, scope: &CacheScope) -> Self {
        Self {
            dir: cache_dir.join(scope.directory_name()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entry name for the recordset a truss describes
    pub fn vault_name(truss: &Truss) -> String {
        let folder = truss
            .resolved_path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(folder.as_bytes());
        hasher.update(&[0]);
        hasher.update(truss.file_name().as_bytes());
        hasher.update(&[0]);
        hasher.update(&truss.file_modified_ms.to_le_bytes());
        hasher.update(&truss.file_size.to_le_bytes());
        hasher.update(&truss.recordset_ordinal.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn entry_path(&self, truss: &Truss) -> PathBuf {
        self.dir
            .join(format!("{}.{}", Self::vault_name(truss), ENTRY_EXTENSION))
    }

    /// Look up a single truss. Corrupt or outdated entries count as misses.
    pub fn lookup(&self, truss: &Truss) -> Option<Vault> {
        let path = self.entry_path(truss);
        let bytes = fs::read(&path).ok()?;
        let cached: CachedVault = match bincode::deserialize(&bytes) {
            Ok(cached) => cached,
            Err(e) => {
                debug!(entry = %path.display(), error = %e, "Unreadable cache entry");
                return None;
            }
        };
        if cached.version != CACHE_VERSION {
            debug!(entry = %path.display(), version = cached.version, "Outdated cache entry");
            return None;
        }
        Some(rehydrate(cached.vault, truss))
    }

    /// Batch lookup. Hits are returned and their trusses removed from
    /// `jobs`; what remains are genuine misses.
    pub fn load_from_cache(&self, jobs: &mut TrussJobs, progress: &mut ProgressManager) -> Vec<Vault> {
        if !self.dir.is_dir() {
            progress.finish();
            return Vec::new();
        }

        let mut hits = Vec::new();
        jobs.retain_trusses(|truss| {
            progress.advance(1);
            match self.lookup(truss) {
                Some(vault) => {
                    hits.push(vault);
                    false
                }
                None => true,
            }
        });
        progress.finish();

        debug!(hits = hits.len(), misses = jobs.truss_count(), "Cache lookup complete");
        hits
    }

    /// Persist vaults that are not cached yet. Returns the number written.
    pub fn store(&self, vaults: &[Vault]) -> usize {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Cannot create cache directory");
            return 0;
        }

        let mut written = 0;
        for vault in vaults {
            let path = self.entry_path(&vault.truss);
            if path.exists() {
                continue;
            }
            match write_entry(&path, vault) {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    entry = %path.display(),
                    file = %vault.truss.resolved_path.display(),
                    error = %e,
                    "Cache write failed"
                ),
            }
        }
        written
    }

    /// Remove every entry of this scope
    pub fn clear(&self) -> std::io::Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Total bytes of all entries of this scope
    pub fn size_bytes(&self) -> u64 {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .filter(|m| m.is_file())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn write_entry(path: &Path, vault: &Vault) -> crate::Result<()> {
    let encoded = bincode::serialize(&CachedVault {
        version: CACHE_VERSION,
        vault: vault.clone(),
    })?;

    // Write atomically (temp file + rename)
    let temp_path = path.with_extension(format!("{}.tmp", ENTRY_EXTENSION));
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Cached vaults carry the paths of whichever file stored them; the current
/// truss decides how this file was reached.
fn rehydrate(mut vault: Vault, truss: &Truss) -> Vault {
    vault.truss.source_path = truss.source_path.clone();
    vault.truss.resolved_path = truss.resolved_path.clone();
    vault.truss.link_path = truss.link_path.clone();
    vault.truss.object_directory = truss.object_directory.clone();
    vault.truss.complete = true;
    vault
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::step::LoadProgress;
    use crate::test_support::sample_truss;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scope() -> CacheScope {
        CacheScope {
            device_name: "Dev".to_string(),
            channel_number: 1,
            settings: String::new(),
        }
    }

    fn progress(units: u64) -> ProgressManager {
        ProgressManager::new(Arc::new(NoProgress), LoadProgress::Matched, LoadProgress::Restored, units)
    }

    fn parsed(truss: Truss) -> Vault {
        let mut vault = Vault::from_truss(truss);
        vault.metrics.insert("alt.max".to_string(), 120.5);
        vault.scores.insert("samples".to_string(), 42);
        vault
    }

    #[test]
    fn test_round_trip_is_field_equal() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let vault = parsed(sample_truss("/logs/Dev/A.lvc", 1_000));

        assert_eq!(cache.store(std::slice::from_ref(&vault)), 1);
        let restored = cache.lookup(&vault.truss).unwrap();

        assert!(restored.same_content(&vault));
        assert!(cache.size_bytes() > 0);
    }

    #[test]
    fn test_batch_lookup_removes_hits() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let cached = sample_truss("/logs/Dev/A.lvc", 1_000);
        let mut second = cached.clone();
        second.recordset_ordinal = 1;
        let missing = sample_truss("/logs/Dev/B.lvc", 2_000);
        cache.store(&[parsed(cached.clone()), parsed(second.clone())]);

        let mut jobs = TrussJobs::new();
        jobs.push(cached);
        jobs.push(second);
        jobs.push(missing.clone());

        let hits = cache.load_from_cache(&mut jobs, &mut progress(3));

        assert_eq!(hits.len(), 2);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs.trusses().next().unwrap(), &missing);
    }

    #[test]
    fn test_changed_file_misses() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let truss = sample_truss("/logs/Dev/A.lvc", 1_000);
        cache.store(&[parsed(truss.clone())]);

        let mut touched = truss.clone();
        touched.file_modified_ms += 1;
        assert!(cache.lookup(&touched).is_none());

        let mut other_scope = scope();
        other_scope.channel_number = 2;
        assert!(VaultCache::new(temp.path(), &other_scope).lookup(&truss).is_none());
    }

    #[test]
    fn test_hit_is_rehydrated_with_current_link() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let direct = sample_truss("/logs/Dev/A.lvc", 1_000);
        cache.store(&[parsed(direct.clone())]);

        let mut via_link = direct.clone();
        via_link.source_path = PathBuf::from("/logs/Dev/plane/B.lvc");
        via_link.link_path = Some(via_link.source_path.clone());

        let hit = cache.lookup(&via_link).unwrap();
        assert_eq!(hit.truss.link_path, via_link.link_path);
        assert_eq!(hit.truss.source_path, via_link.source_path);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let truss = sample_truss("/logs/Dev/A.lvc", 1_000);
        cache.store(&[parsed(truss.clone())]);
        fs::write(cache.entry_path(&truss), b"garbage").unwrap();

        assert!(cache.lookup(&truss).is_none());
    }

    #[test]
    fn test_store_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file, not a dir").unwrap();
        let cache = VaultCache::new(&blocker, &scope());

        assert_eq!(cache.store(&[parsed(sample_truss("/a.lvc", 1))]), 0);
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let cache = VaultCache::new(temp.path(), &scope());
        let truss = sample_truss("/logs/Dev/A.lvc", 1_000);
        cache.store(&[parsed(truss.clone())]);

        cache.clear().unwrap();
        assert!(cache.lookup(&truss).is_none());
        assert_eq!(cache.size_bytes(), 0);
    }
}
