//! Metrics for the artifact storage engine
//!
//! Thin wrappers over the `metrics` facade; nothing is recorded unless the
//! embedding process installs a recorder.
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, histogram};

// ============================================================================
// Write Metrics
// ============================================================================

/// Record a published artifact
pub fn record_artifact_written(artifact: &str, format: &str, rows: u64, bytes: u64) {
    counter!("codeidx_artifact_rows_written_total", "artifact" => artifact.to_string())
        .increment(rows);
    counter!("codeidx_artifact_bytes_written_total", "artifact" => artifact.to_string())
        .increment(bytes);
    counter!("codeidx_artifact_writes_total", "format" => format.to_string()).increment(1);
}

/// Record one shard file written
pub fn record_shard_written(artifact: &str, bytes: u64) {
    counter!("codeidx_shards_written_total", "artifact" => artifact.to_string()).increment(1);
    histogram!("codeidx_shard_bytes").record(bytes as f64);
}

/// Record a byte budget overflow that was allowed to proceed
pub fn record_budget_warning(artifact: &str) {
    counter!("codeidx_budget_warnings_total", "artifact" => artifact.to_string()).increment(1);
}

/// Record rows removed by the drop overflow mode
pub fn record_rows_dropped(artifact: &str, rows: u64) {
    counter!("codeidx_rows_dropped_total", "artifact" => artifact.to_string()).increment(rows);
}

// ============================================================================
// Read Metrics
// ============================================================================

/// Record one random-access read against a row file
pub fn record_row_read(bytes: u64) {
    counter!("codeidx_row_reads_total").increment(1);
    counter!("codeidx_row_bytes_read_total").increment(bytes);
}

/// Record an offsets validation, and whether the cache answered it
pub fn record_offsets_validation(cached: bool) {
    let outcome = if cached { "cached" } else { "scanned" };
    counter!("codeidx_offsets_validations_total", "outcome" => outcome).increment(1);
}
