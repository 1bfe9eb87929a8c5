//! Configuration management for codeidx

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{Compression, FormatPreference, OverflowMode};

/// Default per-row ceiling, also the default artifact budget
pub const DEFAULT_MAX_JSON_BYTES: u64 = 64 * 1024 * 1024;

/// Default amount of pass-1 output kept in memory for reuse by pass 2
pub const DEFAULT_BUFFER_LIMIT_BYTES: u64 = 8 * 1024 * 1024;

/// Main configuration structure for codeidx
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Artifact writer configuration
    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// Hard per-row ceiling in bytes and the global default budget
    pub max_json_bytes: u64,
    /// Compression applied to written artifacts
    pub compression: Compression,
    /// Shard size target in bytes (0 = derive from the resolved budget)
    pub shard_target_bytes: u64,
    /// Pass-1 output kept for reuse by pass 2, in bytes (0 disables reuse)
    pub buffer_limit_bytes: u64,
    /// Preferred representation
    pub format: FormatPreference,
    /// Per-artifact byte budgets
    pub byte_budgets: ByteBudgetsConfig,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            max_json_bytes: DEFAULT_MAX_JSON_BYTES,
            compression: Compression::None,
            shard_target_bytes: 0,
            buffer_limit_bytes: DEFAULT_BUFFER_LIMIT_BYTES,
            format: FormatPreference::Auto,
            byte_budgets: ByteBudgetsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ByteBudgetsConfig {
    /// Turn every overflow into a failure
    pub strict: bool,
    /// Overrides keyed by artifact name
    pub artifacts: BTreeMap<String, BudgetOverride>,
}

/// A per-artifact budget override as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BudgetOverride {
    /// Bare number, read as `max_bytes`
    Bytes(i64),
    /// Structured form
    Structured(StructuredOverride),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredOverride {
    #[serde(default, alias = "maxBytes", skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<MaxBytesSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow: Option<OverflowMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

/// `max_bytes` inside a structured override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxBytesSetting {
    Bytes(i64),
    /// Use the global default
    Auto(AutoSentinel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSentinel {
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive for the `codeidx` targets
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            [artifacts]
            max_json_bytes = 1000
            compression = "zstd"

            [artifacts.byte_budgets]
            strict = true

            [artifacts.byte_budgets.artifacts]
            chunk_meta = 5000
            repo_map = { max_bytes = "auto", overflow = "warn" }
            graph_relations = { max_bytes = 42, overflow = "drop", strict = false }
            "#,
        )
        .unwrap();

        let budgets = &config.artifacts.byte_budgets;
        assert!(budgets.strict);
        assert_eq!(config.artifacts.compression, Compression::Zstd);
        assert_eq!(budgets.artifacts["chunk_meta"], BudgetOverride::Bytes(5000));
        assert_eq!(
            budgets.artifacts["repo_map"],
            BudgetOverride::Structured(StructuredOverride {
                max_bytes: Some(MaxBytesSetting::Auto(AutoSentinel::Auto)),
                overflow: Some(OverflowMode::Warn),
                strict: None,
            })
        );
        assert_eq!(
            budgets.artifacts["graph_relations"],
            BudgetOverride::Structured(StructuredOverride {
                max_bytes: Some(MaxBytesSetting::Bytes(42)),
                overflow: Some(OverflowMode::Drop),
                strict: Some(false),
            })
        );
    }

    #[test]
    fn test_json_camel_case_alias() {
        let config = Config::from_json_str(
            r#"{"artifacts":{"byte_budgets":{"artifacts":{"call_sites":{"maxBytes":10,"overflow":"fail"}}}}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.artifacts.byte_budgets.artifacts["call_sites"],
            BudgetOverride::Structured(StructuredOverride {
                max_bytes: Some(MaxBytesSetting::Bytes(10)),
                ..
            })
        ));
    }

    #[test]
    fn test_unrecognized_override_shape_rejected() {
        let err = Config::from_toml_str(
            r#"
            [artifacts.byte_budgets.artifacts]
            chunk_meta = "lots"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_toml_str(
            r#"
            [artifacts.byte_budgets.artifacts]
            chunk_meta = { limit = 10 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codeidx.toml");
        tokio::fs::write(&path, "[logging]\nlevel = \"debug\"\njson = true\n")
            .await
            .unwrap();
        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.artifacts.max_json_bytes, DEFAULT_MAX_JSON_BYTES);
    }
}
