//! Rebuild stages and progress checkpoints

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered pipeline stage. A higher scope of work implies every lighter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebuildStep {
    /// A: reset everything including directory validation
    HistoSet,
    /// B: rescan files and rebuild the vault map
    HistoVaults,
    /// C: rebuild the trail recordset from the vault map
    TrailRecordset,
    /// D: refill data into the existing trail
    TrailData,
    /// E: user interface refresh only
    UserInterface,
    /// F: check whether source files changed
    FileCheck,
}

impl RebuildStep {
    /// All steps, most work first
    pub const ALL: [RebuildStep; 6] = [
        RebuildStep::HistoSet,
        RebuildStep::HistoVaults,
        RebuildStep::TrailRecordset,
        RebuildStep::TrailData,
        RebuildStep::UserInterface,
        RebuildStep::FileCheck,
    ];

    pub fn scope_of_work(&self) -> u8 {
        match self {
            RebuildStep::HistoSet => 5,
            RebuildStep::HistoVaults => 4,
            RebuildStep::TrailRecordset => 3,
            RebuildStep::TrailData => 2,
            RebuildStep::UserInterface => 1,
            RebuildStep::FileCheck => 0,
        }
    }

    pub fn is_equal_or_bigger_than(&self, other: RebuildStep) -> bool {
        self.scope_of_work() >= other.scope_of_work()
    }

    /// The step with more work
    pub fn max(self, other: RebuildStep) -> RebuildStep {
        if self.is_equal_or_bigger_than(other) {
            self
        } else {
            other
        }
    }

    pub fn letter(&self) -> char {
        match self {
            RebuildStep::HistoSet => 'A',
            RebuildStep::HistoVaults => 'B',
            RebuildStep::TrailRecordset => 'C',
            RebuildStep::TrailData => 'D',
            RebuildStep::UserInterface => 'E',
            RebuildStep::FileCheck => 'F',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildStep::HistoSet => "A_HISTOSET",
            RebuildStep::HistoVaults => "B_HISTOVAULTS",
            RebuildStep::TrailRecordset => "C_TRAILRECORDSET",
            RebuildStep::TrailData => "D_TRAIL_DATA",
            RebuildStep::UserInterface => "E_USER_INTERFACE",
            RebuildStep::FileCheck => "F_FILE_CHECK",
        }
    }
}

impl fmt::Display for RebuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RebuildStep {
    type Err = String;

    /// Accepts the letter (`b`) or the full name (`B_HISTOVAULTS`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        RebuildStep::ALL
            .into_iter()
            .find(|step| upper == step.as_str() || upper == step.letter().to_string())
            .ok_or_else(|| format!("unknown rebuild step '{}' (expected A..F)", s))
    }
}

/// Fixed progress checkpoints in percent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadProgress {
    Started,
    Initialized,
    PathsVerified,
    Scanned,
    Matched,
    Restored,
    Loaded,
    Cached,
    Recorded,
    Done,
}

impl LoadProgress {
    pub fn percentage(&self) -> u8 {
        match self {
            LoadProgress::Started => 2,
            LoadProgress::Initialized => 5,
            LoadProgress::PathsVerified => 7,
            LoadProgress::Scanned => 11,
            LoadProgress::Matched => 22,
            LoadProgress::Restored => 50,
            LoadProgress::Loaded => 80,
            LoadProgress::Cached => 97,
            LoadProgress::Recorded => 99,
            LoadProgress::Done => 100,
        }
    }
}
