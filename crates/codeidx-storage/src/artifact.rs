//! Whole-artifact reads
//!
//! [`ArtifactReader`] finds the authoritative form of an artifact (meta
//! first, then the single JSON file) and reads rows by global index across
//! shards, inflating delta tuples and columnar payloads back into rows.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use codeidx_common::error::{Error, Result, RowError};
use codeidx_common::types::Compression;

use crate::atomic;
use crate::compaction::{ColumnarPayload, FileIdLookup};
use crate::compression;
use crate::manifest::{ArtifactFormat, ArtifactMeta, ArtifactPaths, PartEntry};
use crate::offsets::ValidatedOffsets;
use crate::reader::{check_required_keys, parse_row, parse_value, RandomAccessReader, ReadRowOptions};
use crate::source::Row;

/// Where an artifact's rows live
#[derive(Debug, Clone)]
pub enum ArtifactLayout {
    Sharded(ArtifactMeta),
    Columnar { meta: ArtifactMeta, path: PathBuf },
    Single { path: PathBuf, compression: Compression },
}

pub struct ArtifactReader {
    paths: ArtifactPaths,
    layout: ArtifactLayout,
    reader: Arc<RandomAccessReader>,
    files: Option<FileIdLookup>,
    options: ReadRowOptions,
    /// First global row index of each part
    starts: Vec<u64>,
}

impl ArtifactReader {
    pub async fn open(dir: impl Into<PathBuf>, name: &str) -> Result<Self> {
        Self::open_with(dir, name, Arc::new(RandomAccessReader::default())).await
    }

    /// Open sharing a reader (and its validation cache) with other artifacts
    pub async fn open_with(
        dir: impl Into<PathBuf>,
        name: &str,
        reader: Arc<RandomAccessReader>,
    ) -> Result<Self> {
        let paths = ArtifactPaths::new(dir, name)?;
        let layout = discover(&paths).await?;
        let starts = match &layout {
            ArtifactLayout::Sharded(meta) => meta
                .parts
                .iter()
                .scan(0u64, |next, part| {
                    let start = *next;
                    *next += part.records;
                    Some(start)
                })
                .collect(),
            _ => Vec::new(),
        };
        debug!("[artifact] opened {} as {}", name, layout_format(&layout));
        Ok(Self {
            paths,
            layout,
            reader,
            files: None,
            options: ReadRowOptions::default(),
            starts,
        })
    }

    /// File id mapping used to inflate delta-encoded rows
    pub fn with_file_lookup(mut self, files: FileIdLookup) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_options(mut self, options: ReadRowOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        self.paths.name()
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn format(&self) -> ArtifactFormat {
        layout_format(&self.layout)
    }

    pub fn meta(&self) -> Option<&ArtifactMeta> {
        match &self.layout {
            ArtifactLayout::Sharded(meta) | ArtifactLayout::Columnar { meta, .. } => Some(meta),
            ArtifactLayout::Single { .. } => None,
        }
    }

    pub async fn count(&self) -> Result<u64> {
        match &self.layout {
            ArtifactLayout::Sharded(meta) | ArtifactLayout::Columnar { meta, .. } => {
                Ok(meta.total_records)
            }
            ArtifactLayout::Single { .. } => Ok(self.load_all().await?.len() as u64),
        }
    }

    /// Validate every offsets sidecar against its shard. Returns the rows checked.
    pub async fn validate(&self) -> Result<u64> {
        let ArtifactLayout::Sharded(meta) = &self.layout else {
            return Ok(0);
        };
        let Some(offsets) = &meta.extensions.offsets else {
            return Ok(0);
        };
        let checks = meta.parts.iter().zip(&offsets.parts).map(|(part, sidecar)| async move {
            let jsonl = self.paths.resolve(&part.path)?;
            let sidecar = self.paths.resolve(sidecar)?;
            let summary = self.validate_part(part, &jsonl, &sidecar).await?;
            Ok::<u64, Error>(summary.rows)
        });
        let rows = try_join_all(checks).await?;
        Ok(rows.into_iter().sum())
    }

    /// Read one row by global index
    pub async fn read_row(&self, index: u64) -> Result<Option<Row>> {
        let mut rows = self.read_rows(&[index]).await?;
        Ok(rows.pop().flatten())
    }

    /// Read rows by global index, in input order
    pub async fn read_rows(&self, indexes: &[u64]) -> Result<Vec<Option<Row>>> {
        let meta = match &self.layout {
            ArtifactLayout::Sharded(meta) => meta,
            _ => {
                let all = self.load_all().await?;
                return Ok(indexes
                    .iter()
                    .map(|&i| usize::try_from(i).ok().and_then(|i| all.get(i)).cloned())
                    .collect());
            }
        };

        // group by part, remembering output positions
        let mut by_part: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (position, &index) in indexes.iter().enumerate() {
            if index >= meta.total_records {
                continue;
            }
            let part = self.starts.partition_point(|&start| start <= index) - 1;
            let local = usize::try_from(index - self.starts[part])
                .map_err(|_| Error::InvalidParameter(format!("row index {index} is too large")))?;
            by_part.entry(part).or_default().push((position, local));
        }

        let mut out: Vec<Option<Row>> = vec![None; indexes.len()];
        for (part, wanted) in by_part {
            let locals: Vec<usize> = wanted.iter().map(|&(_, local)| local).collect();
            let rows = self.read_part_rows(meta, part, &locals).await?;
            for ((position, _), row) in wanted.into_iter().zip(rows) {
                out[position] = row;
            }
        }
        Ok(out)
    }

    async fn read_part_rows(&self, meta: &ArtifactMeta, part: usize, locals: &[usize]) -> Result<Vec<Option<Row>>> {
        let entry = &meta.parts[part];
        let jsonl = self.paths.resolve(&entry.path)?;
        let sidecar = match &meta.extensions.offsets {
            Some(offsets) if !meta.compression.is_compressed() => Some(self.paths.resolve(&offsets.parts[part])?),
            _ => None,
        };

        let Some(sidecar) = sidecar else {
            // no random access into compressed shards
            let rows = self.load_part(meta, entry).await?;
            return Ok(locals.iter().map(|&i| rows.get(i).cloned()).collect());
        };

        self.validate_part(entry, &jsonl, &sidecar).await?;
        if meta.extensions.delta.is_none() {
            return self.reader.read_rows_at(&jsonl, &sidecar, locals, &self.options).await;
        }
        let values = self
            .reader
            .read_values_at(&jsonl, &sidecar, locals, self.options.max_bytes)
            .await?;
        values
            .into_iter()
            .zip(locals)
            .map(|(value, &local)| value.map(|v| self.decode_line_value(meta, v, local)).transpose())
            .collect()
    }

    /// Validate a shard pair and check it is the one `part` describes.
    ///
    /// A pair from another generation fails here even when it is internally
    /// consistent; its cached validation is dropped so the next read
    /// checks again.
    async fn validate_part(&self, part: &PartEntry, jsonl: &Path, sidecar: &Path) -> Result<ValidatedOffsets> {
        let checked = self
            .reader
            .validate(jsonl, sidecar)
            .await
            .and_then(|summary| check_part(part, &summary).map(|()| summary));
        if let Err(e) = &checked {
            if e.is_corruption() {
                self.reader.cache().invalidate(jsonl, sidecar);
            }
        }
        checked
    }

    fn decode_line_value(&self, meta: &ArtifactMeta, value: Value, index: usize) -> Result<Row> {
        let row = match &meta.extensions.delta {
            Some(delta) => {
                let files = self.files.as_ref().ok_or_else(|| {
                    Error::InvalidParameter(format!(
                        "{} is delta encoded; a file id lookup is required",
                        meta.artifact
                    ))
                })?;
                delta.inflate(&value, files, index)?
            }
            None => match value {
                Value::Object(row) => row,
                _ => return Err(RowError::NotAnObject { index }.into()),
            },
        };
        check_required_keys(&row, index, &self.options.required_keys)?;
        Ok(row)
    }

    async fn load_part(&self, meta: &ArtifactMeta, part: &PartEntry) -> Result<Vec<Row>> {
        let path = self.paths.resolve(&part.path)?;
        let ceiling = meta.target_max_bytes.max(self.options.max_bytes);
        let body = read_decoded(&path, Compression::from_path_name(&part.path), ceiling).await?;
        let rows: Vec<Row> = body
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .enumerate()
            .map(|(i, line)| {
                if meta.extensions.delta.is_some() {
                    self.decode_line_value(meta, parse_value(line, i)?, i)
                } else {
                    parse_row(line, i, &self.options.required_keys)
                }
            })
            .collect::<Result<_>>()?;
        if rows.len() as u64 != part.records {
            return Err(Error::Manifest(format!(
                "{}: shard holds {} rows, meta declares {}",
                part.path,
                rows.len(),
                part.records
            )));
        }
        Ok(rows)
    }

    /// Load every row in order
    pub async fn load_all(&self) -> Result<Vec<Row>> {
        match &self.layout {
            ArtifactLayout::Sharded(meta) => {
                let mut rows = Vec::with_capacity(usize::try_from(meta.total_records).unwrap_or(0));
                for part in &meta.parts {
                    rows.extend(self.load_part(meta, part).await?);
                }
                Ok(rows)
            }
            ArtifactLayout::Columnar { meta, path } => {
                let body = read_decoded(path, meta.compression, self.options.max_bytes).await?;
                let payload: ColumnarPayload = serde_json::from_slice(&body)?;
                payload.inflate()
            }
            ArtifactLayout::Single { path, compression } => {
                let body = read_decoded(path, *compression, self.options.max_bytes).await?;
                let values: Vec<Value> = serde_json::from_slice(&body)?;
                values
                    .into_iter()
                    .enumerate()
                    .map(|(index, value)| match value {
                        Value::Object(row) => {
                            check_required_keys(&row, index, &self.options.required_keys)?;
                            Ok(row)
                        }
                        _ => Err(RowError::NotAnObject { index }.into()),
                    })
                    .collect()
            }
        }
    }
}

fn check_part(part: &PartEntry, summary: &ValidatedOffsets) -> Result<()> {
    if summary.rows != part.records {
        return Err(Error::Manifest(format!(
            "{}: sidecar holds {} rows, meta declares {}",
            part.path, summary.rows, part.records
        )));
    }
    if summary.file_size != part.bytes {
        return Err(Error::Manifest(format!(
            "{}: shard holds {} bytes, meta declares {}",
            part.path, summary.file_size, part.bytes
        )));
    }
    Ok(())
}

fn layout_format(layout: &ArtifactLayout) -> ArtifactFormat {
    match layout {
        ArtifactLayout::Sharded(_) => ArtifactFormat::JsonlSharded,
        ArtifactLayout::Columnar { .. } => ArtifactFormat::Columnar,
        ArtifactLayout::Single { .. } => ArtifactFormat::Json,
    }
}

async fn read_decoded(path: &Path, compression: Compression, ceiling: u64) -> Result<Vec<u8>> {
    let raw = tokio::fs::read(path).await?;
    compression::decode(&raw, compression, ceiling)
}

async fn discover(paths: &ArtifactPaths) -> Result<ArtifactLayout> {
    if atomic::exists(&paths.meta()).await? {
        let meta = ArtifactMeta::load(&paths.meta()).await?;
        return match meta.format {
            ArtifactFormat::JsonlSharded => Ok(ArtifactLayout::Sharded(meta)),
            ArtifactFormat::Columnar => {
                let rel = meta
                    .parts
                    .first()
                    .map_or_else(|| paths.columnar_file_name(meta.compression), |p| p.path.clone());
                let path = paths.resolve(&rel)?;
                Ok(ArtifactLayout::Columnar { meta, path })
            }
            ArtifactFormat::Json => Err(Error::Manifest(format!(
                "{}: meta describes a single-file artifact",
                meta.artifact
            ))),
        };
    }
    for compression in Compression::ALL {
        let path = paths.single(compression);
        if atomic::exists(&path).await? {
            return Ok(ArtifactLayout::Single { path, compression });
        }
    }
    Err(Error::Io(std::io::Error::new(
        ErrorKind::NotFound,
        format!("artifact {} not found in {}", paths.name(), paths.dir().display()),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetPolicy;
    use crate::source::VecSource;
    use crate::writer::{ArtifactSpec, ShardedRowWriter};
    use crate::WriterOptions;
    use codeidx_common::types::FormatPreference;
    use serde_json::json;

    fn source(n: usize) -> VecSource {
        VecSource::from_values(
            (0..n)
                .map(|i| json!({"id": i, "value": format!("row-{i}")}))
                .collect(),
        )
        .unwrap()
    }

    async fn write(dir: &Path, format: FormatPreference, compression: Compression) {
        let options = WriterOptions {
            shard_target_bytes: 120,
            compression,
            ..WriterOptions::default()
        };
        let spec = ArtifactSpec::new("chunk_meta", BudgetPolicy::unlimited("chunk_meta")).with_format(format);
        ShardedRowWriter::new(dir, options)
            .write(&spec, &source(12))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_global_index_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), FormatPreference::Jsonl, Compression::None).await;

        let reader = ArtifactReader::open(dir.path(), "chunk_meta").await.unwrap();
        assert_eq!(reader.format(), ArtifactFormat::JsonlSharded);
        assert!(reader.meta().unwrap().parts.len() > 1);
        assert_eq!(reader.count().await.unwrap(), 12);
        assert_eq!(reader.validate().await.unwrap(), 12);

        let rows = reader.read_rows(&[11, 0, 5, 12]).await.unwrap();
        let ids: Vec<Option<u64>> = rows.iter().map(|r| r.as_ref().map(|r| r["id"].as_u64().unwrap())).collect();
        assert_eq!(ids, vec![Some(11), Some(0), Some(5), None]);
    }

    #[tokio::test]
    async fn test_compressed_and_single_forms_load() {
        for compression in Compression::ALL {
            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), FormatPreference::Jsonl, compression).await;
            let reader = ArtifactReader::open(dir.path(), "chunk_meta").await.unwrap();
            let rows = reader.load_all().await.unwrap();
            assert_eq!(rows.len(), 12, "{compression}");
            assert_eq!(reader.read_row(7).await.unwrap().unwrap()["value"], "row-7");

            let dir = tempfile::tempdir().unwrap();
            write(dir.path(), FormatPreference::Auto, compression).await;
            let reader = ArtifactReader::open(dir.path(), "chunk_meta").await.unwrap();
            assert_eq!(reader.format(), ArtifactFormat::Json);
            assert_eq!(reader.count().await.unwrap(), 12);
        }
    }

    #[tokio::test]
    async fn test_compressed_part_with_wrong_row_count_fails() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), FormatPreference::Jsonl, Compression::Zstd).await;
        let reader = ArtifactReader::open(dir.path(), "chunk_meta").await.unwrap();
        let first = dir.path().join(&reader.meta().unwrap().parts[0].path);

        let short = compression::encode(b"{\"id\":0,\"value\":\"row-0\"}\n", Compression::Zstd).unwrap();
        tokio::fs::write(&first, short).await.unwrap();
        let err = reader.read_row(0).await.unwrap_err();
        assert!(matches!(err, Error::Manifest(_)), "{err:?}");
        assert!(reader.load_all().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArtifactReader::open(dir.path(), "nothing").await.err().unwrap();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == ErrorKind::NotFound));
    }
}
