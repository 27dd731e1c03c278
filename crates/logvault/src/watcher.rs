//! Change watcher over the validated directory set
//!
//! One background thread owns the OS watcher and its raw event queue.
//! Relevant events set a shared flag immediately and feed a single
//! coalescing timer; once events stop for the debounce window, the
//! accumulated paths go to the [`ChangeNotifier`] in one call.
//!
//! Watches are registered per directory (non-recursive) down to the scan
//! depth, and directories created later are registered as they appear.

use crate::folders::DirectorySet;
use crate::scanner::FileFilter;
use notify::event::{CreateKind, EventKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Upper bound on how long the event loop waits before checking for stop
const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Collaborators
// ============================================================================

/// Receives one aggregated notification per burst of changes
pub trait ChangeNotifier: Send + Sync {
    fn notify_changes(&self, paths: &[PathBuf]);
}

/// Logs the burst and nothing else
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn notify_changes(&self, paths: &[PathBuf]) {
        info!(
            count = paths.len(),
            paths = %paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" | "),
            "Log files changed"
        );
    }
}

impl ChangeNotifier for mpsc::Sender<Vec<PathBuf>> {
    fn notify_changes(&self, paths: &[PathBuf]) {
        let _ = self.send(paths.to_vec());
    }
}

/// Cooperative stop request shared with the event loop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// "Something changed since you last asked"
#[derive(Debug, Clone, Default)]
pub struct ChangeFlag(Arc<AtomicBool>);

impl ChangeFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Read and clear in one step
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// ============================================================================
// Debouncer
// ============================================================================

/// Cancel-and-reschedule timer accumulating a deduplicated path set.
///
/// Time is passed in, so bursts can be replayed deterministically.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeSet<PathBuf>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    /// Add a path and push the deadline out to `now + window`
    pub fn push(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path);
        self.deadline = Some(now + self.window);
    }

    /// Pending paths once the window elapsed without new events
    pub fn poll(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(std::mem::take(&mut self.pending).into_iter().collect())
            }
            _ => None,
        }
    }

    pub fn time_until_flush(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    pub fn is_idle(&self) -> bool {
        self.deadline.is_none()
    }
}

// ============================================================================
// Event processing
// ============================================================================

/// Turns raw events into flag updates and debounced notifications
pub struct EventProcessor {
    directories: DirectorySet,
    filter: FileFilter,
    max_depth: usize,
    flag: ChangeFlag,
    debouncer: Debouncer,
    notifier: Arc<dyn ChangeNotifier>,
}

impl EventProcessor {
    pub fn new(
        directories: DirectorySet,
        filter: FileFilter,
        max_depth: usize,
        debounce: Duration,
        flag: ChangeFlag,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            directories,
            filter,
            max_depth,
            flag,
            debouncer: Debouncer::new(debounce),
            notifier,
        }
    }

    /// Directories to watch for the set, down to the scan depth
    pub fn watch_targets(&self) -> Vec<PathBuf> {
        let mut targets = Vec::new();
        for root in self.directories.all_paths() {
            targets.extend(self.directories_below(&root));
        }
        targets
    }

    fn directories_below(&self, dir: &Path) -> Vec<PathBuf> {
        let Some(depth) = self.directories.depth_below(dir) else {
            return Vec::new();
        };
        if depth > self.max_depth || !dir.is_dir() {
            return Vec::new();
        }
        WalkDir::new(dir)
            .max_depth(self.max_depth - depth)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect()
    }

    fn is_relevant(&self, path: &Path) -> bool {
        if path.is_dir() {
            return self.directories.depth_below(path).is_some();
        }
        self.directories.is_matching_path(path, self.max_depth) && self.filter.accepts(path)
    }

    /// Handle one raw event. Returns directories that need a new watch.
    pub fn handle_event(&mut self, event: &Event, now: Instant) -> Vec<PathBuf> {
        let relevant_kind = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
        );
        if !relevant_kind {
            return Vec::new();
        }

        let mut new_dirs = Vec::new();
        for path in &event.paths {
            let created_dir = matches!(event.kind, EventKind::Create(CreateKind::Folder))
                || (matches!(event.kind, EventKind::Create(_)) && path.is_dir());
            if created_dir {
                new_dirs.extend(self.directories_below(path));
            }
            if self.is_relevant(path) {
                debug!(path = %path.display(), kind = ?event.kind, "Relevant change");
                self.flag.set();
                self.debouncer.push(path.clone(), now);
            }
        }
        new_dirs
    }

    /// Flush the debouncer if its window elapsed
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.debouncer.poll(now) {
            Some(paths) if !paths.is_empty() => {
                self.notifier.notify_changes(&paths);
                true
            }
            _ => false,
        }
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        self.debouncer
            .time_until_flush(now)
            .map_or(POLL_INTERVAL, |d| d.min(POLL_INTERVAL))
    }
}

// ============================================================================
// Watcher
// ============================================================================

struct Running {
    token: CancelToken,
    handle: JoinHandle<()>,
    directories: DirectorySet,
}

/// Background change watcher. Idle until started; stopping is idempotent.
pub struct ChangeWatcher {
    max_depth: usize,
    debounce: Duration,
    notifier: Arc<dyn ChangeNotifier>,
    flag: ChangeFlag,
    running: Option<Running>,
}

impl ChangeWatcher {
    pub fn new(max_depth: usize, debounce: Duration, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            max_depth,
            debounce,
            notifier,
            flag: ChangeFlag::default(),
            running: None,
        }
    }

    /// Watch `directories`, replacing any previous watch
    pub fn start(&mut self, directories: &DirectorySet, filter: FileFilter) -> crate::Result<()> {
        self.stop();

        let processor = EventProcessor::new(
            directories.clone(),
            filter,
            self.max_depth,
            self.debounce,
            self.flag.clone(),
            Arc::clone(&self.notifier),
        );

        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, NotifyConfig::default())?;
        let targets = processor.watch_targets();
        for dir in &targets {
            register(&mut watcher, dir);
        }

        let token = CancelToken::new();
        let loop_token = token.clone();
        let handle = std::thread::Builder::new()
            .name("logvault-watch".to_string())
            .spawn(move || run_event_loop(processor, watcher, rx, loop_token))?;

        info!(
            directories = directories.len(),
            watches = targets.len(),
            "Change watcher started"
        );
        self.running = Some(Running {
            token,
            handle,
            directories: directories.clone(),
        });
        Ok(())
    }

    /// Request stop and wait for the event loop. No-op when idle.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.token.cancel();
        if running.handle.join().is_err() {
            warn!("Change watcher thread panicked");
        }
        debug!("Change watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Directories currently watched
    pub fn directories(&self) -> Option<&DirectorySet> {
        self.running.as_ref().map(|r| &r.directories)
    }

    pub fn has_changed_log_files_then_reset(&self) -> bool {
        self.flag.take()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn register(watcher: &mut RecommendedWatcher, dir: &Path) {
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(dir = %dir.display(), error = %e, "Failed to watch directory");
    }
}

fn run_event_loop(
    mut processor: EventProcessor,
    mut watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    token: CancelToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }
        match rx.recv_timeout(processor.next_timeout(Instant::now())) {
            Ok(Ok(event)) => {
                for dir in processor.handle_event(&event, Instant::now()) {
                    register(&mut watcher, &dir);
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Watcher error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        processor.tick(Instant::now());
    }
}
