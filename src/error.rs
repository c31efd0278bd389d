//! Changelog error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during changelog operations.
#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to initialize log at {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: Box<ChangelogError>,
    },

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("invalid log file name: {name}")]
    InvalidLogFileName { name: String },

    #[error("invalid key string: {value}")]
    InvalidKeyString { value: String },

    #[error("invalid key bytes: {len} bytes")]
    InvalidKeyBytes { len: usize },

    #[error("key string encoding {encoded:?} contains a reserved character ('_' or '.')")]
    InvalidKeyEncoding { encoded: String },

    #[error("unable to rotate head log file to {to}: {source}")]
    Rotation {
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rotation requires a non-empty head log file")]
    RotationOnEmptyHead,

    #[error("unable to delete log files: {}", format_paths(.files))]
    UndeletableFiles { files: Vec<PathBuf> },

    #[error("log at {path} is already open with a different record parser type")]
    ParserMismatch { path: PathBuf },
}

fn format_paths(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
