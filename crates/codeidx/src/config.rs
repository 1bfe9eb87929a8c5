//! Configuration loading

use std::path::Path;

use anyhow::{Context, Result};
use codeidx_common::config::Config;

/// Load configuration from file. `None` when the file is absent.
///
/// Runs before logging is initialized, so callers report the outcome.
pub async fn load(path: &Path) -> Result<Option<Config>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }
    Config::load(path)
        .await
        .map(Some)
        .with_context(|| format!("loading {}", path.display()))
}

/// Load configuration that the caller named explicitly; a missing file is an error
pub async fn load_required(path: &Path) -> Result<Config> {
    Config::load(path)
        .await
        .with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_optional_config_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codeidx.toml");
        assert!(load(&path).await.unwrap().is_none());
        assert!(load_required(&path).await.is_err());
    }
}
