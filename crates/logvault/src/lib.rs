//! LogVault - Log File Discovery & Vault Cache
//!
//! Finds recorded log files of the active device, extracts lightweight
//! trusses from their headers, selects the relevant ones and promotes them
//! to vaults, served from a persistent cache whenever possible.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌───────────────┐
//! │  Folders    │     │  Scanner    │     │  Criteria   │     │  Cache/Parser │
//! │ (dir set +  │────▶│ (walk +     │────▶│ (device,    │────▶│ (vault map,   │
//! │  validate)  │     │  trusses)   │     │  object..)  │     │  trail)       │
//! └─────────────┘     └─────────────┘     └─────────────┘     └───────────────┘
//!        ▲
//!        └──── Watcher (debounced change flag)
//! ```
//!
//! # Core Concepts
//!
//! - **Truss**: header-level description of one recordset, cheap to extract
//! - **Vault**: a fully parsed recordset, keyed by its start timestamp
//! - **Rebuild step**: how much of the pipeline a cycle has to redo
//! - **Link file**: a small file pointing at a log stored elsewhere

pub mod cache;
pub mod config;
pub mod container;
pub mod context;
pub mod criteria;
pub mod error;
pub mod exclusions;
pub mod folders;
pub mod jobs;
pub mod parser;
pub mod picker;
pub mod progress;
pub mod scanner;
pub mod source;
pub mod step;
pub mod trail;
pub mod types;
pub mod watcher;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::LogVaultConfig;
pub use container::ContainerParser;
pub use context::{ActiveContext, ContextProvider, DeviceProfile};
pub use error::{ParseError, Result, VaultError};
pub use jobs::DuplicateHandling;
pub use parser::FormatParser;
pub use picker::{RebuildOutcome, VaultPicker};
pub use step::{LoadProgress, RebuildStep};
pub use types::{DirectoryType, PickedVaults, ScanStatistics, SourceKind, Truss, Vault};
