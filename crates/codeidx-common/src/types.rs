//! Shared type definitions for codeidx

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What a byte budget does when an artifact grows past it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowMode {
    /// Abort the build stage
    Fail,
    /// Alias of `Fail`
    Abort,
    /// Log and continue
    Warn,
    /// Split the artifact across more shards
    Shard,
    /// Truncate rows past the budget
    Drop,
}

impl OverflowMode {
    /// True for modes that turn an overflow into a hard failure
    pub fn is_fatal(self) -> bool {
        matches!(self, OverflowMode::Fail | OverflowMode::Abort)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverflowMode::Fail => "fail",
            OverflowMode::Abort => "abort",
            OverflowMode::Warn => "warn",
            OverflowMode::Shard => "shard",
            OverflowMode::Drop => "drop",
        }
    }
}

impl fmt::Display for OverflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking an observed size against a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetInfo {
    pub limit_bytes: u64,
    pub used_bytes: u64,
    pub over_bytes: u64,
    pub overflow: OverflowMode,
}

impl BudgetInfo {
    pub fn is_over(&self) -> bool {
        self.over_bytes > 0
    }
}

/// Compression codec applied to a whole artifact file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Manifest tag for the codec
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    /// Extension suffix appended after `.json` / `.jsonl`
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Zstd => ".zst",
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }

    /// Infer the codec from a file name
    pub fn from_path_name(name: &str) -> Self {
        if name.ends_with(".gz") {
            Compression::Gzip
        } else if name.ends_with(".zst") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    pub const ALL: [Compression; 3] = [Compression::None, Compression::Gzip, Compression::Zstd];
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "zstd" | "zst" => Ok(Compression::Zstd),
            other => Err(format!("unknown compression: {other}")),
        }
    }
}

/// Preferred on-disk representation for an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPreference {
    /// Single JSON when it fits, JSONL shards otherwise
    #[default]
    Auto,
    /// Single JSON array (still shards on overflow)
    Json,
    /// Always JSONL shards
    Jsonl,
    /// Struct-of-arrays payload when the rows allow it
    Columnar,
}

/// Render a byte count in human-readable units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
