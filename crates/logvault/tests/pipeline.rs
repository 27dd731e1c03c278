//! End-to-end rebuild cycles over a sandboxed data directory

use chrono::{Duration as ChronoDuration, Local};
use logvault::container::{write_container, ContainerHeader, RecordsetHeader};
use logvault::context::{ActiveContext, DeviceProfile};
use logvault::error::ParseError;
use logvault::exclusions::ExclusionSet;
use logvault::parser::DeviceParsers;
use logvault::source::LINK_MARKER;
use logvault::trail::TrailTable;
use logvault::{
    ContainerParser, DuplicateHandling, LogVaultConfig, RebuildStep, SourceKind, Truss, Vault,
    VaultPicker,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// 2020-01-10 00:00:00 UTC
const JAN_10_2020_MS: i64 = 1_578_614_400_000;

struct TestEnv {
    temp: TempDir,
    config: LogVaultConfig,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = LogVaultConfig::default();
        config.data_dir = temp.path().join("data");
        config.cache_dir = temp.path().join("cache");
        config.self_describing_extensions = vec!["dat".to_string()];
        config.watch_directories = false;
        config.threads = 2;
        fs::create_dir_all(config.data_dir.join("Dev")).unwrap();
        Self { temp, config }
    }

    fn device_dir(&self) -> PathBuf {
        self.config.data_dir.join("Dev")
    }

    fn container(&self, rel: &str, object_key: &str, start_ms: i64) -> PathBuf {
        let path = self.device_dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let header = ContainerHeader {
            device: "Dev".to_string(),
            object_key: object_key.to_string(),
            recordsets: vec![RecordsetHeader {
                ordinal: 0,
                name: "1) Flight".to_string(),
                channel: 1,
                start_ms,
            }],
        };
        write_container(&path, &header, &[(0, vec![("altitude", 12.5)]), (0, vec![("altitude", 14.0)])])
            .unwrap();
        path
    }

    fn link(&self, rel: &str, target: &Path) -> PathBuf {
        let path = self.device_dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{}{}\n", LINK_MARKER, target.display())).unwrap();
        path
    }

    /// A.dat, B.dat linking to A.dat and an unsupported C.xyz
    fn linked_pair(&self) -> (PathBuf, PathBuf) {
        let a = self.container("A.dat", "", JAN_10_2020_MS);
        let b = self.link("B.dat", &a);
        fs::write(self.device_dir().join("C.xyz"), "noise").unwrap();
        (a, b)
    }

    fn picker(&self) -> VaultPicker {
        VaultPicker::new(self.config.clone(), Arc::new(ContainerParser))
    }
}

fn context() -> ActiveContext {
    ActiveContext::new(DeviceProfile::new("Dev"), 1).with_retrospect_months(1200)
}

fn recent_ms(days_ago: i64) -> i64 {
    (Local::now() - ChronoDuration::days(days_ago)).timestamp_millis()
}

#[test]
fn test_linked_duplicate_is_discarded() {
    let env = TestEnv::new();
    let (a, b) = env.linked_pair();
    let mut picker = env.picker();

    let outcome = picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    let stats = &outcome.statistics;
    assert_eq!(stats.files_matched, 2);
    assert_eq!(stats.files_non_workable, 1);
    assert_eq!(stats.trusses_extracted, 2);
    assert_eq!(stats.duplicates_suppressed, 1);

    let picked = picker.picked();
    assert_eq!(picked.len(), 1);
    let vaults = picked.get(JAN_10_2020_MS).unwrap();
    assert_eq!(vaults.len(), 1);
    assert_eq!(vaults[0].truss.source_path, a);
    assert_eq!(vaults[0].metrics.get("altitude.max"), Some(&14.0));

    assert_eq!(picker.suppressed().len(), 1);
    assert_eq!(picker.suppressed()[0].source_path, b);
    assert_eq!(picker.suppressed()[0].resolved_path, a);
}

#[test]
fn test_keep_retains_both_copies() {
    let mut env = TestEnv::new();
    env.config.duplicate_handling = DuplicateHandling::Keep;
    let (_, b) = env.linked_pair();
    let mut picker = env.picker();

    picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    let vaults = picker.picked().get(JAN_10_2020_MS).unwrap();
    assert_eq!(vaults.len(), 2);
    assert!(vaults.iter().any(|v| v.truss.link_path.as_deref() == Some(b.as_path())));
    assert!(picker.suppressed().is_empty());
}

#[test]
fn test_second_rebuild_is_served_from_cache() {
    let env = TestEnv::new();
    env.linked_pair();
    let mut picker = env.picker();

    let first = picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();
    assert_eq!(first.statistics.cache_hits, 0);
    assert_eq!(first.statistics.vaults_parsed, 1);
    let before = picker.picked().clone();

    let second = picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();
    assert_eq!(second.statistics.cache_hits, 1);
    assert_eq!(second.statistics.vaults_parsed, 0);
    assert!(picker.picked().same_content(&before));
}

#[test]
fn test_rebuild_is_idempotent_across_pickers() {
    let env = TestEnv::new();
    env.linked_pair();
    env.container("plane/D.dat", "", recent_ms(3));

    let mut first = env.picker();
    first.rebuild(RebuildStep::HistoSet, &context()).unwrap();
    let mut second = env.picker();
    second.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    assert_eq!(first.picked().len(), 2);
    assert!(first.picked().same_content(second.picked()));
}

#[test]
fn test_retrospect_window_drops_old_recordsets() {
    let env = TestEnv::new();
    env.container("old.dat", "", recent_ms(45));
    let fresh = env.container("fresh.dat", "", recent_ms(1));
    let mut picker = env.picker();

    let ctx = context().with_retrospect_months(1);
    let outcome = picker.rebuild(RebuildStep::HistoSet, &ctx).unwrap();

    assert_eq!(outcome.statistics.trusses_rejected, 1);
    assert_eq!(picker.picked().vault_count(), 1);
    assert_eq!(picker.picked().vaults().next().unwrap().truss.source_path, fresh);
}

#[test]
fn test_empty_object_key_rejected_when_object_active() {
    let env = TestEnv::new();
    env.container("Plane/anonymous.dat", "", recent_ms(1));
    let tagged = env.container("Plane/tagged.dat", "Plane", recent_ms(2));
    let mut picker = env.picker();

    let ctx = context().with_object_key("Plane");
    let outcome = picker.rebuild(RebuildStep::HistoSet, &ctx).unwrap();

    assert_eq!(outcome.statistics.files_matched, 2);
    assert_eq!(outcome.statistics.trusses_rejected, 1);
    assert_eq!(picker.picked().vault_count(), 1);
    assert_eq!(picker.picked().vaults().next().unwrap().truss.source_path, tagged);

    let mut lenient = env.picker();
    lenient
        .rebuild(RebuildStep::HistoSet, &ctx.with_ignore_log_object_key(true))
        .unwrap();
    assert_eq!(lenient.picked().vault_count(), 2);
}

#[test]
fn test_file_check_escalates_on_new_object_folder() {
    let env = TestEnv::new();
    env.container("Plane/first.dat", "Plane", recent_ms(2));
    let mut picker = env.picker();
    let ctx = context().with_object_key("Plane");

    let outcome = picker.rebuild(RebuildStep::FileCheck, &ctx).unwrap();
    assert_eq!(outcome.effective_step, RebuildStep::HistoVaults);
    assert_eq!(picker.picked().vault_count(), 1);

    let outcome = picker.rebuild(RebuildStep::FileCheck, &ctx).unwrap();
    assert_eq!(outcome.effective_step, RebuildStep::FileCheck);

    // a second folder of the same object appears elsewhere in the data dir
    let other = env.config.data_dir.join("Archive").join("plane");
    fs::create_dir_all(&other).unwrap();
    let path = other.join("second.dat");
    let header = ContainerHeader {
        device: "Dev".to_string(),
        object_key: "Plane".to_string(),
        recordsets: vec![RecordsetHeader {
            ordinal: 0,
            name: "1) Flight".to_string(),
            channel: 1,
            start_ms: recent_ms(1),
        }],
    };
    write_container(&path, &header, &[]).unwrap();

    let outcome = picker.rebuild(RebuildStep::FileCheck, &ctx).unwrap();
    assert_eq!(outcome.effective_step, RebuildStep::HistoVaults);
    assert!(outcome.trail_rebuilt);
    assert_eq!(picker.picked().vault_count(), 2);
    assert_eq!(picker.directories().unwrap().len(), 2);

    let outcome = picker.rebuild(RebuildStep::FileCheck, &ctx).unwrap();
    assert_eq!(outcome.effective_step, RebuildStep::FileCheck);
}

#[test]
fn test_channel_change_reuses_listing() {
    let env = TestEnv::new();
    env.linked_pair();
    let mut picker = env.picker();
    picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    let other_channel = ActiveContext::new(DeviceProfile::new("Dev"), 2).with_retrospect_months(1200);
    let outcome = picker.rebuild(RebuildStep::FileCheck, &other_channel).unwrap();

    assert_eq!(outcome.effective_step, RebuildStep::HistoVaults);
    assert_eq!(outcome.statistics.files_matched, 2);
    // listing reused, so nothing was counted by a scan
    assert_eq!(outcome.statistics.files_non_workable, 0);
    assert!(picker.picked().is_empty());
}

#[test]
fn test_slow_folder_access_still_rebuilds() {
    let mut env = TestEnv::new();
    env.config.slow_folder_threshold_ms = 0;
    let a = env.container("plane1/A.dat", "plane1", recent_ms(1));
    let mut picker = env.picker();

    let ctx = context().with_object_key("plane1");
    let outcome = picker.rebuild(RebuildStep::FileCheck, &ctx).unwrap();

    assert_eq!(outcome.effective_step, RebuildStep::HistoVaults);
    assert_eq!(outcome.statistics.files_matched, 1);
    assert_eq!(picker.picked().vault_count(), 1);
    assert_eq!(picker.picked().vaults().next().unwrap().truss.source_path, a);
}

#[test]
fn test_dead_link_is_removed_and_yields_nothing() {
    let env = TestEnv::new();
    let link = env.link("gone.dat", &env.temp.path().join("missing.dat"));
    let mut picker = env.picker();

    let outcome = picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    assert_eq!(outcome.statistics.files_matched, 1);
    assert_eq!(outcome.statistics.trusses_extracted, 0);
    assert!(picker.picked().is_empty());
    assert!(!link.exists());
}

#[test]
fn test_suppress_mode_honours_exclusions() {
    let mut env = TestEnv::new();
    env.config.suppress_mode = true;
    let skipped = env.container("skipped.dat", "", recent_ms(1));
    let kept = env.container("kept.dat", "", recent_ms(2));
    let exclusions = ExclusionSet::new();
    exclusions.exclude_file(&skipped);
    exclusions.exclude_recordset(&kept, "1) Flight");
    let mut picker = env.picker().with_exclusions(Arc::new(exclusions));

    let outcome = picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();

    assert_eq!(outcome.statistics.files_excluded, 1);
    assert_eq!(outcome.statistics.vaults_excluded, 1);
    assert!(picker.picked().is_empty());
}

#[test]
fn test_exclusion_added_between_cycles_reaches_trail() {
    let mut env = TestEnv::new();
    env.config.suppress_mode = true;
    let a = env.container("A.dat", "", recent_ms(1));
    let exclusions = Arc::new(ExclusionSet::new());
    let table = Arc::new(Mutex::new(TrailTable::default()));
    let mut picker = env
        .picker()
        .with_exclusions(exclusions.clone())
        .with_trail(Box::new(Arc::clone(&table)));

    picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();
    assert_eq!(picker.picked().vault_count(), 1);
    assert_eq!(table.lock().unwrap().rows.len(), 1);

    exclusions.exclude_recordset(&a, "1) Flight");
    let outcome = picker.rebuild(RebuildStep::TrailRecordset, &context()).unwrap();

    assert_eq!(outcome.effective_step, RebuildStep::TrailRecordset);
    assert_eq!(outcome.statistics.vaults_excluded, 1);
    assert!(picker.picked().is_empty());
    assert_eq!(picker.suppressed().len(), 1);
    assert_eq!(picker.suppressed()[0].source_path, a);
    assert!(table.lock().unwrap().rows.is_empty());

    // refill cycles do not bring it back
    picker.rebuild(RebuildStep::TrailData, &context()).unwrap();
    assert!(picker.picked().is_empty());
}

#[test]
fn test_raw_imports_go_through_device_parser() {
    let mut env = TestEnv::new();
    let import_dir = env.temp.path().join("import");
    fs::create_dir_all(import_dir.join("Heli")).unwrap();
    fs::write(import_dir.join("Heli").join("flight.bin"), b"\x01\x02\x03").unwrap();
    env.config.import_folders = vec![import_dir];

    let device = |kind: SourceKind, _: &Path, trusses: &[Truss]| -> Result<Vec<Vault>, ParseError> {
        assert_eq!(kind, SourceKind::ImportRaw);
        Ok(trusses
            .iter()
            .cloned()
            .map(|truss| {
                let mut vault = Vault::from_truss(truss);
                vault.scores.insert("samples".to_string(), 3);
                vault
            })
            .collect())
    };
    let parsers = DeviceParsers {
        primary: ContainerParser,
        device,
    };
    let mut picker = VaultPicker::new(env.config.clone(), Arc::new(parsers));
    let ctx = ActiveContext::new(DeviceProfile::new("Dev").with_import_extensions(["bin"]), 1);

    picker.rebuild(RebuildStep::HistoSet, &ctx).unwrap();

    let vault = picker.picked().vaults().next().unwrap();
    assert_eq!(picker.picked().vault_count(), 1);
    assert_eq!(vault.truss.kind, SourceKind::ImportRaw);
    assert_eq!(vault.truss.object_key, "Heli");
    assert_eq!(vault.truss.recordset_base_name, "Channel 1 flight");
    assert_eq!(vault.scores.get("samples"), Some(&3));

    let request = vault.truss.kind.load(vault).unwrap();
    assert_eq!(request.recordset_ordinal, None);
}

#[test]
#[ignore = "relies on OS file notifications"]
fn test_watcher_flags_new_files() {
    let mut env = TestEnv::new();
    env.config.watch_directories = true;
    env.config.debounce_ms = 50;
    env.container("A.dat", "", recent_ms(2));
    let mut picker = env.picker();

    picker.rebuild(RebuildStep::HistoSet, &context()).unwrap();
    assert!(picker.is_watching());

    env.container("B.dat", "", recent_ms(1));
    std::thread::sleep(std::time::Duration::from_millis(500));

    let outcome = picker.rebuild(RebuildStep::FileCheck, &context()).unwrap();
    assert_eq!(outcome.effective_step, RebuildStep::HistoVaults);
    assert_eq!(picker.picked().vault_count(), 2);

    picker.close();
    assert!(!picker.is_watching());
}
