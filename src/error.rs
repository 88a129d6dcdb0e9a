use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityKind {
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch { expected: String, actual: String },
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {expected} bytes, got {actual})")
            }
            IntegrityKind::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("transfer of {locator} failed: {message}")]
    TransferFailure { locator: String, message: String },

    #[error("integrity check failed for {path}: {kind}")]
    IntegrityFailure { path: PathBuf, kind: IntegrityKind },

    #[error("unrecognized read file suffix: {0}")]
    #[diagnostic(help("expected one of _1.fastq.gz, _2.fastq.gz or .fastq.gz"))]
    UnrecognizedSuffix(String),

    #[error("grouping {grouping} spans more than one sample: {}", .samples.join(", "))]
    AmbiguousGrouping {
        grouping: String,
        samples: Vec<String>,
    },

    #[error("could not find mirror root `{marker}` in {path}")]
    MirrorRootNotFound { path: String, marker: String },

    #[error("no data for grouping {0}")]
    EmptyGrouping(String),

    #[error("invalid record for run {run}: {message}")]
    InvalidRecord { run: String, message: String },

    #[error("invalid locator: {0}")]
    InvalidLocator(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("missing config file ena-mirror.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read record set {path}: {message}")]
    RecordSource { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation cancelled")]
    Cancelled,
}
