//! Command handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::info;

use codeidx_common::config::Config;
use codeidx_common::types::format_bytes;
use codeidx_storage::artifact::{ArtifactLayout, ArtifactReader};
use codeidx_storage::budget::resolve_budget_map;
use codeidx_storage::compaction::FileIdLookup;
use codeidx_storage::reader::{RandomAccessReader, ReadRowOptions};

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Describe an artifact: its form, counts and parts
pub async fn inspect(dir: &Path, name: &str, config: &Config) -> Result<()> {
    let reader = ArtifactReader::open(dir, name)
        .await?
        .with_options(ReadRowOptions::default().with_max_bytes(config.artifacts.max_json_bytes));
    let records = reader.count().await?;

    let summary = match reader.layout() {
        ArtifactLayout::Single { path, compression } => json!({
            "artifact": name,
            "format": reader.format(),
            "compression": compression,
            "path": path.display().to_string(),
            "records": records,
        }),
        ArtifactLayout::Sharded(meta) | ArtifactLayout::Columnar { meta, .. } => {
            info!(
                "[inspect] {}: {} records in {} part(s), {}",
                name,
                records,
                meta.parts.len(),
                format_bytes(meta.total_bytes)
            );
            serde_json::to_value(meta)?
        }
    };
    print_json(&summary)
}

/// Full integrity pass over one shard and its offsets sidecar
pub async fn validate(jsonl: &Path, offsets: &Path) -> Result<()> {
    let reader = RandomAccessReader::default();
    let summary = match reader.validate(jsonl, offsets).await {
        Ok(summary) => summary,
        Err(e) if e.is_corruption() => {
            bail!("{} does not match {}: {e}", offsets.display(), jsonl.display())
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!(
                "validating {} against {}",
                offsets.display(),
                jsonl.display()
            )))
        }
    };
    print_json(&json!({
        "jsonl": jsonl.display().to_string(),
        "offsets": offsets.display().to_string(),
        "rows": summary.rows,
        "fileSize": summary.file_size,
        "ok": true,
    }))
}

/// Read rows by global index; rows that do not exist print as `null`
pub async fn read(
    dir: &Path,
    name: &str,
    indexes: &[u64],
    files: Option<&PathBuf>,
    config: &Config,
) -> Result<()> {
    if indexes.is_empty() {
        bail!("at least one row index is required");
    }
    let mut reader = ArtifactReader::open_with(dir, name, Arc::new(RandomAccessReader::default()))
        .await?
        .with_options(ReadRowOptions::default().with_max_bytes(config.artifacts.max_json_bytes));
    if let Some(path) = files {
        reader = reader.with_file_lookup(load_file_lookup(path).await?);
    }

    for row in reader.read_rows(indexes).await? {
        let line = match row {
            Some(row) => serde_json::to_string(&Value::Object(row))?,
            None => "null".to_string(),
        };
        println!("{line}");
    }
    Ok(())
}

/// Print the resolved budget of every known and configured artifact
pub fn budgets(config: &Config) -> Result<()> {
    print_json(&resolve_budget_map(&config.artifacts))
}

/// A JSON array of file paths; a path's position is its file id
async fn load_file_lookup(path: &Path) -> Result<FileIdLookup> {
    let body = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let paths: Vec<String> = serde_json::from_slice(&body)
        .with_context(|| format!("{} must be a JSON array of file paths", path.display()))?;
    Ok(FileIdLookup::from_paths(paths))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_lookup_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        tokio::fs::write(&path, br#"["src/a.rs","src/b.rs"]"#).await.unwrap();

        let lookup = load_file_lookup(&path).await.unwrap();
        assert_eq!(lookup.id_of("src/b.rs"), Some(1));
        assert_eq!(lookup.path_of(0), Some("src/a.rs"));

        tokio::fs::write(&path, br#"{"src/a.rs":0}"#).await.unwrap();
        assert!(load_file_lookup(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_reports_mismatched_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("symbols.part-00000.jsonl");
        let sidecar = dir.path().join("symbols.part-00000.jsonl.offsets.bin");
        tokio::fs::write(&jsonl, b"{\"a\":1}\n{\"a\":2}\n").await.unwrap();
        tokio::fs::write(&sidecar, 3u64.to_le_bytes()).await.unwrap();

        let err = validate(&jsonl, &sidecar).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));

        let missing = dir.path().join("gone.jsonl");
        let err = validate(&missing, &sidecar).await.unwrap_err();
        assert!(err.to_string().starts_with("validating"));
    }

    #[tokio::test]
    async fn test_read_requires_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let err = read(dir.path(), "symbols", &[], None, &Config::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("row index"));
    }
}
