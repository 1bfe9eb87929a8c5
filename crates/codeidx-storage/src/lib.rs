//! codeidx Storage Engine
//!
//! Persists large row streams ("artifacts") under per-artifact byte
//! budgets and serves random-access reads against them:
//! - Budget policy resolution and enforcement
//! - Two-pass sharded JSONL writer with atomic replacement
//! - Offsets sidecars for O(1) row lookup, with integrity validation
//! - Delta and columnar row compaction

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod artifact;
pub mod atomic;
pub mod budget;
pub mod cache;
pub mod compaction;
pub mod compression;
pub mod manifest;
pub mod offsets;
pub mod ordering;
pub mod reader;
pub mod source;
pub mod writer;

pub use artifact::{ArtifactLayout, ArtifactReader};
pub use budget::{
    apply_budget, resolve_budget_map, resolve_policy, BudgetPolicy, BudgetReporter, BudgetSnapshot,
    StageCheckpoints, TracingReporter,
};
pub use cache::ValidationCache;
pub use manifest::{ArtifactFormat, ArtifactMeta, PartEntry, PieceEntry};
pub use reader::{RandomAccessReader, ReadRowOptions};
pub use source::{FnSource, Row, RowSource, VecSource};
pub use writer::{ArtifactSpec, ShardedRowWriter, WriteResult};

use codeidx_common::config::ArtifactsConfig;
use codeidx_common::types::{Compression, FormatPreference};

/// Writer options
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Hard per-row ceiling, newline included
    pub max_json_bytes: u64,
    /// Codec applied to every written file
    pub compression: Compression,
    /// Shard size target; 0 derives it from the artifact's budget
    pub shard_target_bytes: u64,
    /// Pass-1 lines kept in memory for pass 2
    pub buffer_limit_bytes: u64,
    /// Preferred representation
    pub format: FormatPreference,
}

impl From<&ArtifactsConfig> for WriterOptions {
    fn from(config: &ArtifactsConfig) -> Self {
        Self {
            max_json_bytes: config.max_json_bytes,
            compression: config.compression,
            shard_target_bytes: config.shard_target_bytes,
            buffer_limit_bytes: config.buffer_limit_bytes,
            format: config.format,
        }
    }
}

impl From<ArtifactsConfig> for WriterOptions {
    fn from(config: ArtifactsConfig) -> Self {
        Self::from(&config)
    }
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self::from(&ArtifactsConfig::default())
    }
}
