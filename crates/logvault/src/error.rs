//! Error types for the vault pipeline

use crate::types::CacheKey;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Vault pipeline error type
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Cache encoding error: {0}")]
    CacheEncode(#[from] bincode::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Dead link: {0}")]
    DeadLink(PathBuf),

    #[error("Job {key} is inconsistent: trusses disagree on resolved path ({first} vs {other})")]
    InconsistentJob {
        key: CacheKey,
        first: PathBuf,
        other: PathBuf,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, VaultError>;

/// Failure of a single format parse. Drops that file's contribution only.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Not a supported format: {0}")]
    NotSupportedFormat(String),

    #[error("Inconsistent content: {0}")]
    Inconsistent(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
