// THEORY:
// Errors are split by the boundary at which they are decided. Configuration and
// manifest errors are fatal for the whole run, because no valid work can start
// without them. `RecordError` is the per-record failure: it never escapes the
// worker that produced it and is instead routed to the `ErrorSink`. Partition
// errors are fatal for one bucket only. `PipelineError` is what the batch driver
// itself can return.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading or validating a `PrepConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal manifest failures. `Format` and `Value` are the two cases a
/// well-read but unusable manifest can produce.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {path} is missing required column '{column}'")]
    Format { path: PathBuf, column: &'static str },
    #[error("manifest row {row}: invalid {column} value '{value}'")]
    Value {
        row: u64,
        column: &'static str,
        value: String,
    },
    #[error("failed to open manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed manifest {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// The three raw inputs that make up one record on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Image,
    Mask,
    Detections,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Image => f.write_str("image"),
            InputKind::Mask => f.write_str("mask"),
            InputKind::Detections => f.write_str("detections"),
        }
    }
}

/// One raw input that could not be found where the naming convention expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingInput {
    pub kind: InputKind,
    pub path: PathBuf,
}

impl fmt::Display for MissingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.path.display())
    }
}

/// Stable tag for a per-record failure, as written to the error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingFile,
    Parse,
    DimensionMismatch,
    EmptyRegion,
    Decode,
    CacheIo,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingFile => "MissingFileError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::DimensionMismatch => "DimensionMismatchError",
            ErrorKind::EmptyRegion => "EmptyRegionError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::CacheIo => "CacheIoError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recoverable failure for a single record. The batch always continues.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("input files not found: {}", join_display(.missing))]
    MissingFile { missing: Vec<MissingInput> },
    #[error("{input} could not be parsed: {detail}")]
    Parse { input: InputKind, detail: String },
    #[error("image and mask dimensions are incompatible: {detail}")]
    DimensionMismatch { detail: String },
    #[error("no usable foreground: {detail}")]
    EmptyRegion { detail: String },
    #[error("failed to decode {input} {path}: {source}")]
    Decode {
        input: InputKind,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to persist artifact {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("build task failed: {detail}")]
    Internal { detail: String },
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecordError::MissingFile { .. } => ErrorKind::MissingFile,
            RecordError::Parse { .. } => ErrorKind::Parse,
            RecordError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            RecordError::EmptyRegion { .. } => ErrorKind::EmptyRegion,
            RecordError::Decode { .. } => ErrorKind::Decode,
            RecordError::CacheIo { .. } => ErrorKind::CacheIo,
            RecordError::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Failures decoding the artifact and condition-file binary layouts.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),
    #[error("truncated input: needed {needed} bytes at offset {offset}")]
    Truncated { needed: usize, offset: usize },
    #[error("field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("field '{field}' has invalid value {value}")]
    InvalidField { field: &'static str, value: u64 },
    #[error("{0} trailing bytes after the last entry")]
    TrailingBytes(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A condition binary file could not be written. Only its own bucket is lost.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("failed to write condition file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures reading predictions or writing the voting report.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("predictions {path} are missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("predictions row {row}: invalid score '{value}'")]
    InvalidScore { row: u64, value: String },
    #[error("failed to read or write {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Fatal failures of the batch driver.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error("failed to prepare directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write error report {path}: {source}")]
    ErrorReport {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("worker pool shut down before all records completed")]
    WorkerPool,
}

fn join_display<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
