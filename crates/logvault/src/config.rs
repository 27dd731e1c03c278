//! Configuration for the vault pipeline

use crate::criteria::DeviceAlias;
use crate::jobs::DuplicateHandling;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration, persisted as TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogVaultConfig {
    /// Primary data directory; device folders live directly below it
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Additional data folders scanned as-is
    #[serde(default)]
    pub data_folders: Vec<PathBuf>,

    /// Folders holding raw device logs
    #[serde(default)]
    pub import_folders: Vec<PathBuf>,

    /// Also pick up import extensions inside the data folders
    #[serde(default = "default_true")]
    pub search_data_path_imports: bool,

    /// Maximum sub directory depth below each source directory
    #[serde(default = "default_sub_directory_level_max")]
    pub sub_directory_level_max: usize,

    /// Honour the exclusion list while scanning and picking
    #[serde(default)]
    pub suppress_mode: bool,

    /// Root of the persistent vault cache
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub duplicate_handling: DuplicateHandling,

    /// Progress weight of a fresh parse relative to a cache hit
    #[serde(default = "default_cache_benefit")]
    pub cache_benefit: u32,

    /// Quiet period before watcher events are reported
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Per-folder resolution time above which access counts as slow
    #[serde(default = "default_slow_folder_threshold_ms")]
    pub slow_folder_threshold_ms: u64,

    /// Link resolution time above which an unresolvable link counts as dead
    #[serde(default = "default_dead_link_threshold_ms")]
    pub dead_link_threshold_ms: u64,

    /// Extensions of self-describing containers, lowercase without the dot
    #[serde(default = "default_self_describing_extensions")]
    pub self_describing_extensions: Vec<String>,

    /// Run the change watcher over the validated directories
    #[serde(default = "default_true")]
    pub watch_directories: bool,

    /// Worker threads for extraction and parsing (0 = auto-detect)
    #[serde(default)]
    pub threads: usize,

    /// Legacy device families accepted as the active device. Kept last so
    /// the TOML array of tables follows all plain values.
    #[serde(default = "default_device_aliases")]
    pub device_aliases: Vec<DeviceAlias>,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("LogVault")
}

fn default_cache_dir() -> PathBuf {
    logvault_logging::logvault_home().join("cache")
}

fn default_true() -> bool {
    true
}

fn default_sub_directory_level_max() -> usize {
    5
}

fn default_cache_benefit() -> u32 {
    10
}

fn default_debounce_ms() -> u64 {
    222
}

fn default_slow_folder_threshold_ms() -> u64 {
    100
}

fn default_dead_link_threshold_ms() -> u64 {
    555
}

fn default_self_describing_extensions() -> Vec<String> {
    vec!["lvc".to_string()]
}

fn default_device_aliases() -> Vec<DeviceAlias> {
    vec![DeviceAlias {
        device: "HoTTViewer".to_string(),
        prefix: "HoTTViewer".to_string(),
    }]
}

impl Default for LogVaultConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            data_folders: Vec::new(),
            import_folders: Vec::new(),
            search_data_path_imports: true,
            sub_directory_level_max: default_sub_directory_level_max(),
            suppress_mode: false,
            cache_dir: default_cache_dir(),
            duplicate_handling: DuplicateHandling::default(),
            cache_benefit: default_cache_benefit(),
            debounce_ms: default_debounce_ms(),
            slow_folder_threshold_ms: default_slow_folder_threshold_ms(),
            dead_link_threshold_ms: default_dead_link_threshold_ms(),
            self_describing_extensions: default_self_describing_extensions(),
            watch_directories: true,
            threads: 0,
            device_aliases: default_device_aliases(),
        }
    }
}

impl LogVaultConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LogVaultConfig =
            toml::from_str(&content).map_err(|e| crate::VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::VaultError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config location: ~/.logvault/config.toml
    pub fn default_path() -> PathBuf {
        logvault_logging::logvault_home().join("config.toml")
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.self_describing_extensions.is_empty() {
            return Err(crate::VaultError::Config(
                "self_describing_extensions must not be empty".to_string(),
            ));
        }
        if self.cache_benefit == 0 {
            return Err(crate::VaultError::Config(
                "cache_benefit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn slow_folder_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_folder_threshold_ms)
    }

    pub fn dead_link_threshold(&self) -> Duration {
        Duration::from_millis(self.dead_link_threshold_ms)
    }

    /// Resolved worker count
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4)
    }

    pub fn is_self_describing_extension(&self, extension: &str) -> bool {
        self.self_describing_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = LogVaultConfig::default();
        assert_eq!(config.cache_benefit, 10);
        assert_eq!(config.debounce_ms, 222);
        assert_eq!(config.dead_link_threshold_ms, 555);
        assert_eq!(config.duplicate_handling, DuplicateHandling::Discard);
        assert!(config.is_self_describing_extension("LVC"));
        assert!(config.worker_threads() > 0);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LogVaultConfig = toml::from_str(
            r#"
            data_dir = "/srv/logs"
            duplicate_handling = "keep"
            import_folders = ["/mnt/import"]
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/logs"));
        assert_eq!(config.duplicate_handling, DuplicateHandling::Keep);
        assert_eq!(config.import_folders.len(), 1);
        assert_eq!(config.sub_directory_level_max, 5);
        assert!(config.watch_directories);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.toml");

        let mut config = LogVaultConfig::default();
        config.data_dir = temp.path().join("data");
        config.self_describing_extensions = vec!["dat".to_string()];
        config.save(&path).unwrap();

        let loaded = LogVaultConfig::load(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.self_describing_extensions, vec!["dat".to_string()]);
        assert_eq!(loaded.device_aliases, config.device_aliases);
    }

    #[test]
    fn test_rejects_empty_extensions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "self_describing_extensions = []\n").unwrap();

        assert!(matches!(
            LogVaultConfig::load(&path),
            Err(crate::VaultError::Config(_))
        ));
    }
}
