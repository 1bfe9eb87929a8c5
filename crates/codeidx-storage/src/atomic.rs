//! Temp-write-then-rename helpers
//!
//! Nothing is visible at its final path until its bytes are complete.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use codeidx_common::error::Result;

/// Sibling path used while `path` is being written
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

/// Write `bytes` to `path` atomically
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path_for(path);
    let written = write_synced(&tmp, bytes).await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    publish_file(&tmp, path).await
}

/// Rename a fully written `staged` file onto `target`
pub async fn publish_file(staged: &Path, target: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(staged, target).await {
        let _ = tokio::fs::remove_file(staged).await;
        return Err(e.into());
    }
    Ok(())
}

/// Create `path` with `bytes` and flush it to disk
pub async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("[artifact-cleanup] removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree, treating "already gone" as success
pub async fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("[artifact-cleanup] removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub async fn exists(path: &Path) -> Result<bool> {
    Ok(tokio::fs::try_exists(path).await?)
}

/// Swap a fully written staging directory into place at `target`.
///
/// The previous directory (if any) is moved aside first and removed only
/// after the new one is visible.
pub async fn publish_dir(staging: &Path, target: &Path) -> Result<()> {
    let retired = temp_path_for(target);
    let had_previous = match tokio::fs::rename(target, &retired).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = tokio::fs::rename(staging, target).await {
        if had_previous {
            let _ = tokio::fs::rename(&retired, target).await;
        }
        return Err(e.into());
    }
    if had_previous {
        remove_dir_if_exists(&retired).await?;
    }
    Ok(())
}
