//! Progress reporting

use crate::step::LoadProgress;
use std::sync::mpsc;
use std::sync::Arc;

/// Receives percentage updates, 0..=100
pub trait ProgressReporter: Send + Sync {
    fn set_progress(&self, percentage: u8);
}

/// Discards all updates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn set_progress(&self, _percentage: u8) {}
}

impl ProgressReporter for mpsc::Sender<u8> {
    fn set_progress(&self, percentage: u8) {
        let _ = self.send(percentage);
    }
}

/// Apportions a checkpoint range over a number of weighted work units.
///
/// Emitted values never decrease and never leave `[start, end]`.
pub struct ProgressManager {
    reporter: Arc<dyn ProgressReporter>,
    start: u8,
    end: u8,
    total_units: u64,
    done_units: u64,
    last_reported: u8,
}

impl ProgressManager {
    pub fn new(
        reporter: Arc<dyn ProgressReporter>,
        start: LoadProgress,
        end: LoadProgress,
        total_units: u64,
    ) -> Self {
        Self {
            reporter,
            start: start.percentage(),
            end: end.percentage(),
            total_units,
            done_units: 0,
            last_reported: start.percentage(),
        }
    }

    /// Work units for `hits` cache hits and `parses` fresh parses
    pub fn weighted_units(hits: usize, parses: usize, cache_benefit: u32) -> u64 {
        hits as u64 + parses as u64 * u64::from(cache_benefit.max(1))
    }

    pub fn advance(&mut self, units: u64) {
        self.done_units = (self.done_units + units).min(self.total_units);
        let percentage = self.current();
        if percentage > self.last_reported {
            self.last_reported = percentage;
            self.reporter.set_progress(percentage);
        }
    }

    pub fn current(&self) -> u8 {
        if self.total_units == 0 {
            return self.end;
        }
        let span = u64::from(self.end.saturating_sub(self.start));
        let offset = span * self.done_units / self.total_units;
        self.start + offset as u8
    }

    /// Jump to the end of the range
    pub fn finish(&mut self) {
        self.done_units = self.total_units;
        if self.end > self.last_reported {
            self.last_reported = self.end;
            self.reporter.set_progress(self.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_units() {
        assert_eq!(ProgressManager::weighted_units(5, 2, 10), 25);
        assert_eq!(ProgressManager::weighted_units(0, 3, 0), 3);
    }

    #[test]
    fn test_progress_within_range_and_monotonic() {
        let (tx, rx) = mpsc::channel::<u8>();
        let mut manager =
            ProgressManager::new(Arc::new(tx), LoadProgress::Restored, LoadProgress::Loaded, 30);

        manager.advance(10);
        manager.advance(0);
        manager.advance(10);
        manager.advance(100);
        manager.finish();

        let updates: Vec<u8> = rx.try_iter().collect();
        assert_eq!(updates, vec![60, 70, 80]);
    }

    #[test]
    fn test_empty_range_reports_end() {
        let manager = ProgressManager::new(
            Arc::new(NoProgress),
            LoadProgress::Matched,
            LoadProgress::Restored,
            0,
        );
        assert_eq!(manager.current(), 50);
    }
}
