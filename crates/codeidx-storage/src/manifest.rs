//! On-disk layout and meta schema
//!
//! ```text
//! <dir>/<name>.json[.gz|.zst]                              single form
//! <dir>/<name>.columnar.json[.gz|.zst]                     columnar form
//! <dir>/<name>.meta.json                                   sharded/columnar meta
//! <dir>/<name>.parts/<name>.part-00000.jsonl[.gz|.zst]     shards
//! <dir>/<name>.parts/<name>.part-00000.jsonl.offsets.bin   sidecars
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use codeidx_common::error::{Error, Result};
use codeidx_common::types::Compression;

use crate::compaction::DeltaExtension;
use crate::ordering::OrderingDigest;

/// Meta schema version written by this crate
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Sidecar suffix appended to a shard file name
pub const OFFSETS_SUFFIX: &str = "offsets.bin";

pub const OFFSETS_FORMAT: &str = "u64-le";

/// True when `version` shares the major version of [`SCHEMA_VERSION`]
pub fn is_supported_version(version: &str) -> bool {
    let major = |v: &str| v.split('.').next().map(str::to_string);
    major(version).is_some() && major(version) == major(SCHEMA_VERSION)
}

/// Physical representation of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "jsonl-sharded")]
    JsonlSharded,
    #[serde(rename = "columnar")]
    Columnar,
}

impl ArtifactFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactFormat::Json => "json",
            ArtifactFormat::JsonlSharded => "jsonl-sharded",
            ArtifactFormat::Columnar => "columnar",
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    /// Relative to the artifact directory, `/` separated
    pub path: String,
    pub records: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetsExtension {
    pub format: String,
    pub suffix: String,
    /// One sidecar per part, same order as `parts`
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrimExtension {
    pub dropped_rows: u64,
    pub kept_rows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<OffsetsExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimExtension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering: Option<OrderingDigest>,
}

/// `<name>.meta.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMeta {
    pub schema_version: String,
    pub artifact: String,
    pub format: ArtifactFormat,
    pub generated_at: String,
    pub compression: Compression,
    pub total_records: u64,
    pub total_bytes: u64,
    pub max_part_records: u64,
    pub max_part_bytes: u64,
    pub target_max_bytes: u64,
    pub parts: Vec<PartEntry>,
    #[serde(default)]
    pub extensions: MetaExtensions,
}

impl ArtifactMeta {
    /// Structural checks a reader relies on
    pub fn validate(&self) -> Result<()> {
        if !is_supported_version(&self.schema_version) {
            return Err(Error::Manifest(format!(
                "{}: unsupported schema version {}",
                self.artifact, self.schema_version
            )));
        }
        for part in &self.parts {
            check_relative_path(&part.path)?;
        }
        let records: u64 = self.parts.iter().map(|p| p.records).sum();
        if self.format == ArtifactFormat::JsonlSharded && records != self.total_records {
            return Err(Error::Manifest(format!(
                "{}: parts hold {} records but meta declares {}",
                self.artifact, records, self.total_records
            )));
        }
        if let Some(offsets) = &self.extensions.offsets {
            if offsets.parts.len() != self.parts.len() {
                return Err(Error::Manifest(format!(
                    "{}: {} offsets sidecars for {} parts",
                    self.artifact,
                    offsets.parts.len(),
                    self.parts.len()
                )));
            }
            for path in &offsets.parts {
                check_relative_path(path)?;
            }
        }
        Ok(())
    }

    /// Read and validate a meta file
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let meta: ArtifactMeta = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))?;
        meta.validate()?;
        Ok(meta)
    }
}

/// One published file, for the pieces manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceEntry {
    #[serde(rename = "type")]
    pub piece_type: String,
    pub name: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Relative to the artifact directory, `/` separated
    pub path: String,
}

/// Reject names that would escape the artifact directory
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.');
    if bad {
        return Err(Error::InvalidParameter(format!("invalid artifact name {name:?}")));
    }
    Ok(())
}

fn check_relative_path(rel: &str) -> Result<()> {
    let path = Path::new(rel);
    let escapes = rel.is_empty()
        || rel.contains('\\')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(Error::Manifest(format!("unsafe part path {rel:?}")));
    }
    Ok(())
}

/// Every path an artifact may occupy inside its directory
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    dir: PathBuf,
    name: String,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        validate_artifact_name(name)?;
        Ok(Self {
            dir: dir.into(),
            name: name.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn single_file_name(&self, compression: Compression) -> String {
        format!("{}.json{}", self.name, compression.suffix())
    }

    pub fn single(&self, compression: Compression) -> PathBuf {
        self.dir.join(self.single_file_name(compression))
    }

    pub fn columnar_file_name(&self, compression: Compression) -> String {
        format!("{}.columnar.json{}", self.name, compression.suffix())
    }

    pub fn columnar(&self, compression: Compression) -> PathBuf {
        self.dir.join(self.columnar_file_name(compression))
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.meta.json", self.name)
    }

    pub fn meta(&self) -> PathBuf {
        self.dir.join(self.meta_file_name())
    }

    pub fn parts_dir_name(&self) -> String {
        format!("{}.parts", self.name)
    }

    pub fn parts_dir(&self) -> PathBuf {
        self.dir.join(self.parts_dir_name())
    }

    /// File name of shard `index`, zero padded to five digits
    pub fn part_file_name(&self, index: usize, compression: Compression) -> String {
        format!("{}.part-{:05}.jsonl{}", self.name, index, compression.suffix())
    }

    /// Meta-relative path of shard `index`
    pub fn part_rel(&self, index: usize, compression: Compression) -> String {
        format!("{}/{}", self.parts_dir_name(), self.part_file_name(index, compression))
    }

    pub fn offsets_file_name(part_file_name: &str) -> String {
        format!("{part_file_name}.{OFFSETS_SUFFIX}")
    }

    /// Resolve a meta-relative path, refusing anything that escapes the directory
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        check_relative_path(rel)?;
        Ok(rel.split('/').fold(self.dir.clone(), |acc, part| acc.join(part)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_names() {
        let paths = ArtifactPaths::new("/out", "call_sites").unwrap();
        assert_eq!(paths.single(Compression::Gzip), PathBuf::from("/out/call_sites.json.gz"));
        assert_eq!(paths.meta(), PathBuf::from("/out/call_sites.meta.json"));
        assert_eq!(paths.columnar_file_name(Compression::None), "call_sites.columnar.json");
        assert_eq!(
            paths.columnar(Compression::Zstd),
            PathBuf::from("/out/call_sites.columnar.json.zst")
        );
        assert_eq!(
            paths.part_rel(3, Compression::None),
            "call_sites.parts/call_sites.part-00003.jsonl"
        );
        assert_eq!(
            ArtifactPaths::offsets_file_name("call_sites.part-00003.jsonl"),
            "call_sites.part-00003.jsonl.offsets.bin"
        );
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let paths = ArtifactPaths::new("/out", "repo_map").unwrap();
        assert!(paths.resolve("repo_map.parts/repo_map.part-00000.jsonl").is_ok());
        assert!(paths.resolve("../etc/passwd").is_err());
        assert!(paths.resolve("/etc/passwd").is_err());
        assert!(paths.resolve("a/./b").is_err());
        assert!(ArtifactPaths::new("/out", "../x").is_err());
        assert!(ArtifactPaths::new("/out", "").is_err());
    }

    #[test]
    fn test_meta_json_shape() {
        let meta = ArtifactMeta {
            schema_version: SCHEMA_VERSION.to_string(),
            artifact: "symbols".to_string(),
            format: ArtifactFormat::JsonlSharded,
            generated_at: "2024-01-01T00:00:00Z".to_string(),
            compression: Compression::None,
            total_records: 2,
            total_bytes: 20,
            max_part_records: 2,
            max_part_bytes: 20,
            target_max_bytes: 100,
            parts: vec![PartEntry {
                path: "symbols.parts/symbols.part-00000.jsonl".to_string(),
                records: 2,
                bytes: 20,
            }],
            extensions: MetaExtensions {
                trim: Some(TrimExtension {
                    dropped_rows: 1,
                    kept_rows: 2,
                }),
                ..MetaExtensions::default()
            },
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["format"], "jsonl-sharded");
        assert_eq!(value["schemaVersion"], "1.0.0");
        assert_eq!(value["totalRecords"], 2);
        assert_eq!(value["extensions"]["trim"]["droppedRows"], 1);
        assert!(value["extensions"].get("delta").is_none());
        meta.validate().unwrap();

        let mut broken = meta.clone();
        broken.total_records = 3;
        assert!(broken.validate().is_err());
        broken.total_records = 2;
        broken.schema_version = "2.0.0".to_string();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_piece_entry_type_field() {
        let piece = PieceEntry {
            piece_type: "symbols".to_string(),
            name: "symbols_offsets".to_string(),
            format: "bin".to_string(),
            compression: None,
            count: Some(2),
            path: "symbols.parts/symbols.part-00000.jsonl.offsets.bin".to_string(),
        };
        let value = serde_json::to_value(&piece).unwrap();
        assert_eq!(value["type"], "symbols");
        assert!(value.get("compression").is_none());
    }
}
