//! Rebuild orchestrator
//!
//! Drives one rebuild cycle through the stages of [`RebuildStep`]:
//!
//! ```text
//! validate ─▶ scan ─▶ extract ─▶ select ─▶ dedup ─▶ cache ─▶ parse ─▶ store ─▶ trail
//!   (F)       └──────────────────────── (B) ───────────────────────────────┘   (C/D)
//! ```
//!
//! A light request is escalated to a full vault rebuild when the directory
//! set changed, on the first call, or when the watcher saw relevant files
//! change. All cycle state lives in one context value owned by the picker.

use crate::cache::{CacheScope, VaultCache};
use crate::config::LogVaultConfig;
use crate::context::{ActiveContext, ContextProvider};
use crate::criteria::SelectionCriteria;
use crate::exclusions::{ExclusionList, NoExclusions};
use crate::folders::{DirectoryResolver, DirectorySet, Validation};
use crate::jobs::{DuplicateHandling, DuplicateResolver, TrussJobs};
use crate::parser::FormatParser;
use crate::progress::{NoProgress, ProgressManager, ProgressReporter};
use crate::scanner::{FileFilter, FileScanner};
use crate::source::{extract_all, ExtractContext};
use crate::step::{LoadProgress, RebuildStep};
use crate::trail::{NoTrail, TrailConsumer};
use crate::types::{PickedVaults, ScanStatistics, SourceFile, Truss, Vault, VaultIdentity};
use crate::watcher::{ChangeNotifier, ChangeWatcher, LogNotifier};
use chrono::Local;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// Outcome
// ============================================================================

/// What a rebuild call actually did
#[derive(Debug, Clone, Serialize)]
pub struct RebuildOutcome {
    pub requested_step: RebuildStep,
    /// Requested step after escalation
    pub effective_step: RebuildStep,
    pub trail_rebuilt: bool,
    pub trail_refilled: bool,
    /// Counters of this call; zero for stages that did not run
    pub statistics: ScanStatistics,
}

impl RebuildOutcome {
    /// Steps covered by the effective step, most work first
    pub fn executed_steps(&self) -> Vec<RebuildStep> {
        RebuildStep::ALL
            .into_iter()
            .filter(|s| self.effective_step.is_equal_or_bigger_than(*s))
            .collect()
    }

    pub fn vaults_rebuilt(&self) -> bool {
        self.effective_step.is_equal_or_bigger_than(RebuildStep::HistoVaults)
    }
}

// ============================================================================
// State
// ============================================================================

/// Everything that survives between rebuild calls
#[derive(Debug, Default)]
struct RebuildContext {
    /// Listing of the last scan, reused on channel-only changes
    files: Vec<SourceFile>,
    validation: Option<Validation>,
    picked: PickedVaults,
    suppressed: Vec<Truss>,
}

/// Vaults gathered by parse workers, behind one lock
#[derive(Default)]
struct Collected {
    picked: PickedVaults,
    identities: HashSet<VaultIdentity>,
    suppressed: Vec<Truss>,
    fresh: Vec<Vault>,
    excluded: usize,
}

/// Guarded insert into the vault map
struct Collector<'a> {
    handling: DuplicateHandling,
    suppress_mode: bool,
    exclusions: &'a dyn ExclusionList,
    inner: Mutex<Collected>,
}

impl<'a> Collector<'a> {
    fn new(handling: DuplicateHandling, suppress_mode: bool, exclusions: &'a dyn ExclusionList) -> Self {
        Self {
            handling,
            suppress_mode,
            exclusions,
            inner: Mutex::new(Collected::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `fresh` vaults came from a parse and still need a cache entry
    fn insert(&self, vault: Vault, fresh: bool) {
        let mut collected = self.lock();
        if fresh {
            collected.fresh.push(vault.clone());
        }

        if self.suppress_mode
            && self
                .exclusions
                .is_excluded(&vault.truss.source_path, &vault.truss.recordset_base_name)
        {
            debug!(
                file = %vault.truss.source_path.display(),
                recordset = %vault.truss.recordset_base_name,
                "Vault excluded"
            );
            collected.excluded += 1;
            return;
        }

        if self.handling == DuplicateHandling::Discard && !collected.identities.insert(vault.identity()) {
            warn!(
                file = %vault.truss.source_path.display(),
                recordset = %vault.truss.recordset_base_name,
                start_timestamp_ms = vault.start_timestamp_ms(),
                "Duplicate vault suppressed"
            );
            collected.suppressed.push(vault.truss);
            return;
        }

        collected.picked.insert(vault);
    }

    fn into_inner(self) -> Collected {
        self.inner.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// Picker
// ============================================================================

/// Owns the rebuild state machine for one host
pub struct VaultPicker {
    config: LogVaultConfig,
    parser: Arc<dyn FormatParser>,
    exclusions: Arc<dyn ExclusionList>,
    progress: Arc<dyn ProgressReporter>,
    trail: Box<dyn TrailConsumer>,
    notifier: Arc<dyn ChangeNotifier>,
    resolver: DirectoryResolver,
    watcher: Option<ChangeWatcher>,
    state: RebuildContext,
}

impl VaultPicker {
    pub fn new(config: LogVaultConfig, parser: Arc<dyn FormatParser>) -> Self {
        let resolver = DirectoryResolver::new(&config);
        Self {
            config,
            parser,
            exclusions: Arc::new(NoExclusions),
            progress: Arc::new(NoProgress),
            trail: Box::new(NoTrail),
            notifier: Arc::new(LogNotifier),
            resolver,
            watcher: None,
            state: RebuildContext::default(),
        }
    }

    pub fn with_exclusions(mut self, exclusions: Arc<dyn ExclusionList>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_trail(mut self, trail: Box<dyn TrailConsumer>) -> Self {
        self.trail = trail;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &LogVaultConfig {
        &self.config
    }

    /// Vault map of the last full rebuild
    pub fn picked(&self) -> &PickedVaults {
        &self.state.picked
    }

    /// Trusses and vaults dropped as duplicates or excluded since the last full rebuild
    pub fn suppressed(&self) -> &[Truss] {
        &self.state.suppressed
    }

    pub fn directories(&self) -> Option<&DirectorySet> {
        self.state.validation.as_ref().map(|v| &v.directories)
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.as_ref().map_or(false, ChangeWatcher::is_running)
    }

    /// Stop the watcher. The picker stays usable.
    pub fn close(&mut self) {
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.stop();
        }
    }

    fn report(&self, checkpoint: LoadProgress) {
        self.progress.set_progress(checkpoint.percentage());
    }

    /// Rebuild against the context `provider` reports right now
    pub fn rebuild_from(
        &mut self,
        requested: RebuildStep,
        provider: &dyn ContextProvider,
    ) -> crate::Result<RebuildOutcome> {
        let ctx = provider.active_context();
        self.rebuild(requested, &ctx)
    }

    /// Run one rebuild cycle of at least `requested` scope
    pub fn rebuild(&mut self, requested: RebuildStep, ctx: &ActiveContext) -> crate::Result<RebuildOutcome> {
        let start = Instant::now();
        let mut step = requested;
        let mut statistics = ScanStatistics::default();
        self.report(LoadProgress::Started);

        if step.is_equal_or_bigger_than(RebuildStep::HistoSet) {
            debug!("Resetting rebuild state");
            self.resolver.reset();
            self.state = RebuildContext::default();
            self.close();
        }
        self.report(LoadProgress::Initialized);

        let first_run = self.state.validation.is_none();
        let validation = self.resolver.validate(ctx);
        let files_changed = self
            .watcher
            .as_ref()
            .map_or(false, ChangeWatcher::has_changed_log_files_then_reset);
        if first_run || validation.changed || files_changed {
            step = step.max(RebuildStep::HistoVaults);
        }
        statistics.directories = validation.directories.len();
        info!(
            requested = %requested,
            effective = %step,
            first_run,
            directories_changed = validation.changed,
            files_changed,
            slow_folder_access = validation.slow_folder_access,
            "Rebuild started"
        );
        self.report(LoadProgress::PathsVerified);

        if step.is_equal_or_bigger_than(RebuildStep::HistoVaults) {
            let reuse_listing = validation.channel_change_only
                && !files_changed
                && !requested.is_equal_or_bigger_than(RebuildStep::HistoVaults);
            self.rebuild_vaults(ctx, &validation, reuse_listing, &mut statistics);
        }

        if self.config.suppress_mode {
            statistics.vaults_excluded += self.remove_excluded();
        }

        if let Err(e) = self.ensure_watcher(&validation) {
            warn!(error = %e, "Change watcher unavailable");
        }
        self.state.validation = Some(validation);

        let mut trail_rebuilt = false;
        let mut trail_refilled = false;
        if step.is_equal_or_bigger_than(RebuildStep::TrailRecordset) {
            self.trail.rebuild(&self.state.picked);
            trail_rebuilt = true;
        } else if step.is_equal_or_bigger_than(RebuildStep::TrailData) {
            self.trail.refill(&self.state.picked);
            trail_refilled = true;
        }
        self.report(LoadProgress::Recorded);

        statistics.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            step = %step,
            timestamps = self.state.picked.len(),
            vaults = self.state.picked.vault_count(),
            elapsed_ms = statistics.elapsed_ms,
            "Rebuild complete"
        );
        self.report(LoadProgress::Done);

        Ok(RebuildOutcome {
            requested_step: requested,
            effective_step: step,
            trail_rebuilt,
            trail_refilled,
            statistics,
        })
    }

    /// Exclusions may change between cycles; drop newly excluded vaults
    /// before the trail sees them.
    fn remove_excluded(&mut self) -> usize {
        let exclusions = self.exclusions.as_ref();
        let removed = self
            .state
            .picked
            .remove_where(|v| exclusions.is_excluded(&v.truss.source_path, &v.truss.recordset_base_name));
        for vault in &removed {
            info!(
                file = %vault.truss.source_path.display(),
                recordset = %vault.truss.recordset_base_name,
                start_timestamp_ms = vault.start_timestamp_ms(),
                "Excluded vault removed"
            );
        }
        let count = removed.len();
        self.state.suppressed.extend(removed.into_iter().map(|v| v.truss));
        count
    }

    fn file_filter(&self, validation: &Validation) -> FileFilter {
        FileFilter::new(
            validation.extensions.clone(),
            &self.config.self_describing_extensions,
            Arc::clone(&self.exclusions),
            self.config.suppress_mode,
        )
    }

    /// Stage B: scan, select and load the vault map from scratch
    fn rebuild_vaults(
        &mut self,
        ctx: &ActiveContext,
        validation: &Validation,
        reuse_listing: bool,
        statistics: &mut ScanStatistics,
    ) {
        self.state.picked.clear();
        self.state.suppressed.clear();

        // scan
        let stage = Instant::now();
        if reuse_listing {
            debug!(files = self.state.files.len(), "Channel change only, reusing file listing");
        } else {
            let scanner = FileScanner::new(
                self.file_filter(validation),
                self.config.sub_directory_level_max,
                self.config.worker_threads(),
            );
            let scan = scanner.scan(&validation.directories);
            statistics.files_non_workable = scan.non_workable_count;
            statistics.files_excluded = scan.excluded_count;
            self.state.files = scan.files;
        }
        statistics.files_matched = self.state.files.len();
        debug!(elapsed_ms = stage.elapsed().as_millis() as u64, "Scan stage");
        self.report(LoadProgress::Scanned);

        // extract + select
        let stage = Instant::now();
        let extract_ctx = ExtractContext {
            device: ctx.device.clone(),
            channel_number: ctx.channel_number,
            dead_link_threshold: self.config.dead_link_threshold(),
        };
        let mut trusses = extract_all(&self.state.files, &extract_ctx, self.config.worker_threads());
        statistics.trusses_extracted = trusses.len();
        // first-wins duplicate handling needs a stable order
        trusses.sort_by(|a, b| {
            a.source_path
                .cmp(&b.source_path)
                .then(a.recordset_ordinal.cmp(&b.recordset_ordinal))
        });

        let criteria = SelectionCriteria::from_context(ctx, &self.config.device_aliases, Local::now());
        let selected: Vec<Truss> = trusses.into_iter().filter(|t| criteria.accepts(t)).collect();
        statistics.trusses_rejected = statistics.trusses_extracted - selected.len();

        let mut resolver = DuplicateResolver::new(self.config.duplicate_handling);
        let mut jobs = resolver.resolve(selected);
        let (_, suppressed) = resolver.into_parts();
        statistics.duplicates_suppressed = suppressed.len();
        for e in jobs.take_inconsistent() {
            error!(error = %e, "Skipping inconsistent job");
        }
        debug!(
            jobs = jobs.len(),
            trusses = jobs.truss_count(),
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Selection stage"
        );
        self.report(LoadProgress::Matched);

        // cache
        let cache = VaultCache::new(
            &self.config.cache_dir,
            &CacheScope {
                device_name: ctx.device.name.clone(),
                channel_number: ctx.channel_number,
                settings: ctx.device.channel_label(ctx.channel_number),
            },
        );
        let mut cache_progress = ProgressManager::new(
            Arc::clone(&self.progress),
            LoadProgress::Matched,
            LoadProgress::Restored,
            jobs.truss_count() as u64,
        );
        let hits = cache.load_from_cache(&mut jobs, &mut cache_progress);
        statistics.cache_hits = hits.len();

        // parse + guarded insert
        let stage = Instant::now();
        let collector = Collector::new(
            self.config.duplicate_handling,
            self.config.suppress_mode,
            self.exclusions.as_ref(),
        );
        let mut parse_progress = ProgressManager::new(
            Arc::clone(&self.progress),
            LoadProgress::Restored,
            LoadProgress::Loaded,
            ProgressManager::weighted_units(hits.len(), jobs.len(), self.config.cache_benefit),
        );
        parse_progress.advance(hits.len() as u64);
        for vault in hits {
            collector.insert(vault, false);
        }
        statistics.parse_failures = self.parse_jobs(jobs, &collector, &mut parse_progress);
        parse_progress.finish();
        debug!(elapsed_ms = stage.elapsed().as_millis() as u64, "Parse stage");

        let mut collected = collector.into_inner();
        statistics.vaults_parsed = collected.fresh.len();
        statistics.vaults_excluded = collected.excluded;
        statistics.duplicates_suppressed += collected.suppressed.len();

        // store
        if !collected.fresh.is_empty() {
            let written = cache.store(&collected.fresh);
            debug!(written, dir = %cache.dir().display(), "Cache updated");
        }
        self.report(LoadProgress::Cached);

        statistics.bytes = collected.picked.vaults().map(Vault::file_size).sum();
        let mut all_suppressed = suppressed;
        all_suppressed.append(&mut collected.suppressed);
        self.state.picked = collected.picked;
        self.state.suppressed = all_suppressed;
    }

    /// Parse remaining jobs on scoped workers. Returns the failure count.
    fn parse_jobs(&self, jobs: TrussJobs, collector: &Collector<'_>, progress: &mut ProgressManager) -> usize {
        if jobs.is_empty() {
            return 0;
        }
        let jobs: Vec<Vec<Truss>> = jobs.into_iter().map(|(_, trusses)| trusses).collect();
        let chunk_size = jobs.len().div_ceil(self.config.worker_threads().max(1));
        let units_per_job = u64::from(self.config.cache_benefit.max(1));
        let parser = self.parser.as_ref();

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<bool>();
            let handles: Vec<_> = jobs
                .chunks(chunk_size)
                .map(|chunk| {
                    let tx = tx.clone();
                    scope.spawn(move || {
                        for trusses in chunk {
                            let ok = parse_job(parser, trusses, collector);
                            let _ = tx.send(ok);
                        }
                    })
                })
                .collect();
            drop(tx);

            let mut failures = 0;
            for ok in rx {
                if !ok {
                    failures += 1;
                }
                progress.advance(units_per_job);
            }
            for handle in handles {
                if handle.join().is_err() {
                    warn!("Parse worker panicked");
                    failures += 1;
                }
            }
            failures
        })
    }

    /// Start or retarget the watcher after validation
    fn ensure_watcher(&mut self, validation: &Validation) -> crate::Result<()> {
        if !self.config.watch_directories {
            return Ok(());
        }
        let current = self.watcher.as_ref().and_then(ChangeWatcher::directories);
        if current == Some(&validation.directories) {
            return Ok(());
        }
        let filter = self.file_filter(validation);
        let watcher = self.watcher.get_or_insert_with(|| {
            ChangeWatcher::new(
                self.config.sub_directory_level_max,
                self.config.debounce(),
                Arc::clone(&self.notifier),
            )
        });
        watcher.start(&validation.directories, filter)
    }
}

impl Drop for VaultPicker {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_job(parser: &dyn FormatParser, trusses: &[Truss], collector: &Collector<'_>) -> bool {
    let Some(first) = trusses.first() else {
        return true;
    };
    match first.kind.read_vaults(parser, &first.resolved_path, trusses) {
        Ok(vaults) => {
            for vault in vaults {
                collector.insert(vault, true);
            }
            true
        }
        Err(e) => {
            warn!(
                file = %first.resolved_path.display(),
                recordsets = trusses.len(),
                error = %e,
                "Parse failed"
            );
            false
        }
    }
}
