//! Per-artifact byte budgets
//!
//! A [`BudgetPolicy`] is resolved once per artifact from the built-in
//! defaults and the configured override, then checked against the measured
//! size with [`apply_budget`]. Checking never changes the artifact; the
//! writer acts on `shard` and `drop` itself.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use codeidx_common::config::{ArtifactsConfig, BudgetOverride, MaxBytesSetting};
use codeidx_common::error::{BudgetError, Result};
use codeidx_common::metrics;
use codeidx_common::types::{format_bytes, BudgetInfo, OverflowMode};

/// Built-in overflow behavior by artifact name
pub const DEFAULT_OVERFLOWS: &[(&str, OverflowMode)] = &[
    ("vfs_manifest", OverflowMode::Fail),
    ("graph_relations", OverflowMode::Drop),
    ("chunk_meta", OverflowMode::Shard),
    ("file_meta", OverflowMode::Shard),
    ("token_postings", OverflowMode::Shard),
    ("repo_map", OverflowMode::Shard),
    ("file_relations", OverflowMode::Shard),
    ("symbols", OverflowMode::Shard),
    ("symbol_edges", OverflowMode::Shard),
    ("symbol_occurrences", OverflowMode::Shard),
    ("call_sites", OverflowMode::Shard),
    ("chunk_uid_map", OverflowMode::Shard),
    ("field_postings", OverflowMode::Shard),
];

/// Overflow behavior for an artifact with no override
pub fn default_overflow(artifact: &str) -> OverflowMode {
    DEFAULT_OVERFLOWS
        .iter()
        .find(|(name, _)| *name == artifact)
        .map_or(OverflowMode::Shard, |(_, mode)| *mode)
}

/// Fully resolved budget for one artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPolicy {
    pub artifact: String,
    /// `None` disables the budget
    pub max_bytes: Option<u64>,
    pub overflow: OverflowMode,
    pub strict: bool,
}

impl BudgetPolicy {
    /// A policy that never triggers
    pub fn unlimited(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            max_bytes: None,
            overflow: OverflowMode::Shard,
            strict: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes.is_some()
    }

    /// True when an overflow must abort the build
    pub fn is_fatal(&self) -> bool {
        self.strict || self.overflow.is_fatal()
    }
}

fn positive(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|&v| v > 0)
}

/// Resolve the policy for `artifact`.
///
/// A bare-number override replaces `max_bytes` and keeps the default
/// overflow. `"auto"` means the global default. Non-positive sizes disable
/// the budget. An override with `strict = true` always wins over the
/// global flag.
pub fn resolve_policy(
    artifact: &str,
    default_max_bytes: Option<u64>,
    budget_override: Option<&BudgetOverride>,
    global_strict: bool,
) -> BudgetPolicy {
    let default_max_bytes = default_max_bytes.filter(|&v| v > 0);
    let mut policy = BudgetPolicy {
        artifact: artifact.to_string(),
        max_bytes: default_max_bytes,
        overflow: default_overflow(artifact),
        strict: global_strict,
    };

    match budget_override {
        None => {}
        Some(BudgetOverride::Bytes(bytes)) => policy.max_bytes = positive(*bytes),
        Some(BudgetOverride::Structured(structured)) => {
            policy.max_bytes = match structured.max_bytes {
                None | Some(MaxBytesSetting::Auto(_)) => default_max_bytes,
                Some(MaxBytesSetting::Bytes(bytes)) => positive(bytes),
            };
            if let Some(overflow) = structured.overflow {
                policy.overflow = overflow;
            }
            if structured.strict == Some(true) {
                policy.strict = true;
            }
        }
    }
    policy
}

/// One budget check, as recorded for build-state reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCheckpoint {
    pub stage: String,
    pub step: String,
    pub label: String,
    pub budget: BudgetInfo,
}

/// Receives budget warnings and checkpoints
pub trait BudgetReporter: Send + Sync {
    fn warn(&self, label: &str, info: &BudgetInfo);

    fn checkpoint(&self, _checkpoint: BudgetCheckpoint) {}
}

/// Reports through `tracing` and the metrics facade
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl BudgetReporter for TracingReporter {
    fn warn(&self, label: &str, info: &BudgetInfo) {
        metrics::record_budget_warning(label);
        warn!(
            "[byte-budget] {} over budget by {} ({} of {}, overflow={})",
            label,
            format_bytes(info.over_bytes),
            format_bytes(info.used_bytes),
            format_bytes(info.limit_bytes),
            info.overflow
        );
    }
}

/// Collects checkpoints and warnings in memory, forwarding warnings to tracing
#[derive(Debug, Default)]
pub struct StageCheckpoints {
    checkpoints: Mutex<Vec<BudgetCheckpoint>>,
    warnings: Mutex<Vec<String>>,
}

impl StageCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<BudgetCheckpoint> {
        self.checkpoints.lock().clone()
    }

    /// Labels that produced a warning, in order
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }
}

impl BudgetReporter for StageCheckpoints {
    fn warn(&self, label: &str, info: &BudgetInfo) {
        TracingReporter.warn(label, info);
        self.warnings.lock().push(label.to_string());
    }

    fn checkpoint(&self, checkpoint: BudgetCheckpoint) {
        self.checkpoints.lock().push(checkpoint);
    }
}

/// Check `observed_bytes` against `policy`.
///
/// Returns `None` when the policy has no budget. An overflow fails when the
/// policy is strict or its mode is `fail`/`abort`, and warns otherwise. The
/// checkpoint is recorded before either outcome.
pub fn apply_budget(
    policy: &BudgetPolicy,
    observed_bytes: u64,
    label: &str,
    reporter: &dyn BudgetReporter,
) -> Result<Option<BudgetInfo>> {
    let Some(limit_bytes) = policy.max_bytes else {
        return Ok(None);
    };
    let info = BudgetInfo {
        limit_bytes,
        used_bytes: observed_bytes,
        over_bytes: observed_bytes.saturating_sub(limit_bytes),
        overflow: policy.overflow,
    };
    reporter.checkpoint(BudgetCheckpoint {
        stage: "artifacts".to_string(),
        step: "byte-budget".to_string(),
        label: label.to_string(),
        budget: info,
    });

    if info.is_over() {
        if policy.is_fatal() {
            return Err(BudgetError::Exceeded {
                label: label.to_string(),
                info,
            }
            .into());
        }
        reporter.warn(label, &info);
    }
    Ok(Some(info))
}

/// Resolved budgets for every known and configured artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub generated_at: String,
    pub max_json_bytes: u64,
    pub strict: bool,
    pub policies: BTreeMap<String, BudgetPolicy>,
}

impl BudgetSnapshot {
    pub fn policy(&self, artifact: &str) -> Option<&BudgetPolicy> {
        self.policies.get(artifact)
    }
}

/// Resolve policies for the built-in artifacts plus every configured override
pub fn resolve_budget_map(config: &ArtifactsConfig) -> BudgetSnapshot {
    let budgets = &config.byte_budgets;
    let default_max = Some(config.max_json_bytes);
    let names = DEFAULT_OVERFLOWS
        .iter()
        .map(|(name, _)| *name)
        .chain(budgets.artifacts.keys().map(String::as_str));

    let policies = names
        .map(|name| {
            let policy = resolve_policy(name, default_max, budgets.artifacts.get(name), budgets.strict);
            (name.to_string(), policy)
        })
        .collect();

    BudgetSnapshot {
        generated_at: chrono::Utc::now().to_rfc3339(),
        max_json_bytes: config.max_json_bytes,
        strict: budgets.strict,
        policies,
    }
}
