//! Error types for codeidx
//!
//! Provides a unified error type hierarchy for the artifact storage engine.

use thiserror::Error;

use crate::types::{format_bytes, BudgetInfo};

/// Result type alias using codeidx's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for codeidx
#[derive(Error, Debug)]
pub enum Error {
    // Budget Errors
    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    // Offsets Errors
    #[error("Offsets error: {0}")]
    Offsets(#[from] OffsetsError),

    // Row Errors
    #[error("Row error: {0}")]
    Row(#[from] RowError),

    // Caller supplied a bad argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Manifest Errors
    #[error("Manifest error: {0}")]
    Manifest(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Byte budget errors
#[derive(Error, Debug)]
pub enum BudgetError {
    #[error(
        "{label} exceeds byte budget: {} used of {} ({} over, overflow={})",
        format_bytes(.info.used_bytes),
        format_bytes(.info.limit_bytes),
        format_bytes(.info.over_bytes),
        .info.overflow
    )]
    Exceeded { label: String, info: BudgetInfo },
}

impl BudgetError {
    pub fn info(&self) -> &BudgetInfo {
        match self {
            BudgetError::Exceeded { info, .. } => info,
        }
    }
}

/// Offsets sidecar errors
///
/// Every variant maps to the same machine-readable code; the message names
/// the invariant that failed.
#[derive(Error, Debug)]
pub enum OffsetsError {
    #[error("offsets invalid: {path} length {len} is not a multiple of 8")]
    Misaligned { path: String, len: u64 },

    #[error("offsets invalid: entry {index} ({value}) exceeds the safe integer range")]
    UnsafeOffset { index: usize, value: u64 },

    #[error("offsets invalid: first offset must be 0, found {value}")]
    NonZeroStart { value: u64 },

    #[error("offsets invalid: offsets not strictly increasing at entry {index} ({prev} -> {value})")]
    NotIncreasing { index: usize, prev: u64, value: u64 },

    #[error("offsets invalid: entry {index} ({value}) is past end of file ({file_size} bytes)")]
    OutOfBounds { index: usize, value: u64, file_size: u64 },

    #[error("offsets invalid: entry {index} ({value}) is not preceded by a newline")]
    MissingNewlineBoundary { index: usize, value: u64 },

    #[error("offsets invalid: no offsets recorded for a non-empty file ({file_size} bytes)")]
    Empty { file_size: u64 },

    #[error("offsets invalid: {path} does not end with a newline")]
    MissingTrailingNewline { path: String },
}

impl OffsetsError {
    pub const CODE: &'static str = "ERR_OFFSETS_INVALID";

    pub fn code(&self) -> &'static str {
        Self::CODE
    }
}

/// Row-level errors
#[derive(Error, Debug)]
pub enum RowError {
    #[error("{context}: row of {bytes} bytes exceeds max JSON size ({limit} bytes)")]
    Oversize { bytes: u64, limit: u64, context: String },

    #[error("row {index} is missing required keys: {keys:?}")]
    MissingKeys { index: usize, keys: Vec<String> },

    #[error("row {index} is not a JSON object")]
    NotAnObject { index: usize },

    #[error("row {index} is malformed: {reason}")]
    Malformed { index: usize, reason: String },
}

impl Error {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Budget(_) => "ERR_BYTE_BUDGET_EXCEEDED",
            Error::Offsets(e) => e.code(),
            Error::Row(RowError::Oversize { .. }) => "ERR_JSON_TOO_LARGE",
            Error::Row(_) => "ERR_ROW_INVALID",
            Error::InvalidParameter(_) => "ERR_INVALID_PARAMETER",
            Error::Config(_) => "ERR_CONFIG",
            Error::Manifest(_) => "ERR_MANIFEST",
            Error::Io(_) => "ERR_IO",
            Error::Serialization(_) => "ERR_SERIALIZATION",
            Error::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// True when the error reports on-disk data that does not match its sidecar or manifest
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Offsets(_) | Error::Manifest(_) | Error::Row(RowError::Malformed { .. })
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
