//! Random access into JSONL row files through their offsets sidecars

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs::File;

use codeidx_common::config::DEFAULT_MAX_JSON_BYTES;
use codeidx_common::error::{Error, OffsetsError, Result, RowError};
use codeidx_common::metrics;

use crate::cache::{PairStamp, ValidationCache};
use crate::offsets::{self, ValidatedOffsets, OFFSET_WIDTH};
use crate::source::Row;

/// Ranges closer than this are merged into one read
pub const COALESCE_GAP_BYTES: u64 = 64 * 1024;

/// Merged reads never span more than this
pub const MAX_BATCH_READ_BYTES: u64 = 1024 * 1024;

/// Per-call read limits
#[derive(Debug, Clone)]
pub struct ReadRowOptions {
    /// Largest row that may be read, in bytes
    pub max_bytes: u64,
    /// Keys every returned row must carry
    pub required_keys: Vec<String>,
}

impl Default for ReadRowOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_JSON_BYTES,
            required_keys: Vec::new(),
        }
    }
}

impl ReadRowOptions {
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

fn check_max_bytes(max_bytes: u64) -> Result<()> {
    if max_bytes == 0 {
        return Err(Error::InvalidParameter(
            "max_bytes must be a positive byte count".to_string(),
        ));
    }
    Ok(())
}

/// Read counters for one reader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub row_reads: u64,
    pub row_bytes: u64,
}

/// Reads rows by index without scanning the row file.
///
/// Every call opens its own handles; the reader only owns its validation
/// cache and counters, so it can be shared freely between tasks.
pub struct RandomAccessReader {
    cache: Arc<ValidationCache>,
    row_reads: AtomicU64,
    row_bytes: AtomicU64,
}

impl Default for RandomAccessReader {
    fn default() -> Self {
        Self::new(Arc::new(ValidationCache::default()))
    }
}

impl RandomAccessReader {
    pub fn new(cache: Arc<ValidationCache>) -> Self {
        Self {
            cache,
            row_reads: AtomicU64::new(0),
            row_bytes: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            row_reads: self.row_reads.load(Ordering::Relaxed),
            row_bytes: self.row_bytes.load(Ordering::Relaxed),
        }
    }

    /// Number of rows indexed by a sidecar
    pub async fn count(&self, offsets_path: &Path) -> Result<u64> {
        offsets::count(offsets_path).await
    }

    /// Full integrity check, memoized per (size, mtime) of both files
    pub async fn validate(&self, jsonl_path: &Path, offsets_path: &Path) -> Result<ValidatedOffsets> {
        let stamp = PairStamp::of(jsonl_path, offsets_path).await?;
        if self.cache.is_valid(jsonl_path, offsets_path, &stamp) {
            metrics::record_offsets_validation(true);
            return Ok(ValidatedOffsets {
                rows: stamp.offsets.size / OFFSET_WIDTH,
                file_size: stamp.jsonl.size,
            });
        }
        let summary = offsets::validate_against_file(jsonl_path, offsets_path).await?;
        metrics::record_offsets_validation(false);
        self.cache.insert(jsonl_path, offsets_path, stamp);
        Ok(summary)
    }

    /// Read one row. Returns `None` past the end or for an empty row.
    pub async fn read_row_at(
        &self,
        jsonl_path: &Path,
        offsets_path: &Path,
        index: usize,
        options: &ReadRowOptions,
    ) -> Result<Option<Row>> {
        let mut rows = self.read_rows_at(jsonl_path, offsets_path, &[index], options).await?;
        Ok(rows.pop().flatten())
    }

    /// Read many rows in input order, duplicates included.
    pub async fn read_rows_at(
        &self,
        jsonl_path: &Path,
        offsets_path: &Path,
        indexes: &[usize],
        options: &ReadRowOptions,
    ) -> Result<Vec<Option<Row>>> {
        let lines = self.read_lines_at(jsonl_path, offsets_path, indexes, options.max_bytes).await?;
        lines
            .into_iter()
            .zip(indexes)
            .map(|(line, &index)| {
                line.map(|bytes| parse_row(&bytes, index, &options.required_keys))
                    .transpose()
            })
            .collect()
    }

    /// Like [`Self::read_rows_at`] but without requiring JSON objects, for
    /// row files holding encoded tuples.
    pub async fn read_values_at(
        &self,
        jsonl_path: &Path,
        offsets_path: &Path,
        indexes: &[usize],
        max_bytes: u64,
    ) -> Result<Vec<Option<Value>>> {
        let lines = self.read_lines_at(jsonl_path, offsets_path, indexes, max_bytes).await?;
        lines
            .into_iter()
            .zip(indexes)
            .map(|(line, &index)| line.map(|bytes| parse_value(&bytes, index)).transpose())
            .collect()
    }

    /// Raw lines (newline included) for `indexes`, in input order.
    ///
    /// Byte ranges of nearby rows are merged so clustered lookups cost one
    /// read per cluster. Every row is size-checked before anything is read.
    async fn read_lines_at(
        &self,
        jsonl_path: &Path,
        offsets_path: &Path,
        indexes: &[usize],
        max_bytes: u64,
    ) -> Result<Vec<Option<Arc<[u8]>>>> {
        check_max_bytes(max_bytes)?;
        if indexes.is_empty() {
            return Ok(Vec::new());
        }
        let (mut jsonl, mut sidecar) = open_pair(jsonl_path, offsets_path).await?;
        let (file_size, total) = sizes(&jsonl, &sidecar, offsets_path).await?;

        let lookups: Vec<usize> = indexes
            .iter()
            .filter(|&&i| (i as u64) < total)
            .flat_map(|&i| [i, i + 1])
            .collect();
        let found = offsets::read_at_in(&mut sidecar, total, &lookups).await?;

        let mut ranges: BTreeMap<usize, (u64, u64)> = BTreeMap::new();
        for &index in indexes {
            if (index as u64) < total && !ranges.contains_key(&index) {
                let (start, end) = row_range(&found, index, file_size)?;
                if end > start {
                    check_row_size(end - start, max_bytes, index)?;
                    ranges.insert(index, (start, end));
                }
            }
        }

        let mut lines: BTreeMap<usize, Arc<[u8]>> = BTreeMap::new();
        for batch in coalesce(&ranges) {
            let bytes = offsets::read_exact_at(&mut jsonl, batch.start, batch.end - batch.start).await?;
            for (index, start, end) in batch.rows {
                let slice = &bytes[(start - batch.start) as usize..(end - batch.start) as usize];
                self.count_read(end - start);
                lines.insert(index, Arc::from(slice));
            }
        }

        Ok(indexes.iter().map(|i| lines.get(i).cloned()).collect())
    }

    fn count_read(&self, bytes: u64) {
        self.row_reads.fetch_add(1, Ordering::Relaxed);
        self.row_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::record_row_read(bytes);
    }
}

async fn open_pair(jsonl_path: &Path, offsets_path: &Path) -> Result<(File, File)> {
    Ok(tokio::try_join!(File::open(jsonl_path), File::open(offsets_path))?)
}

async fn sizes(jsonl: &File, sidecar: &File, offsets_path: &Path) -> Result<(u64, u64)> {
    let (jsonl_meta, sidecar_meta) = tokio::try_join!(jsonl.metadata(), sidecar.metadata())?;
    let len = sidecar_meta.len();
    if len % OFFSET_WIDTH != 0 {
        return Err(OffsetsError::Misaligned {
            path: offsets_path.display().to_string(),
            len,
        }
        .into());
    }
    Ok((jsonl_meta.len(), len / OFFSET_WIDTH))
}

fn row_range(found: &BTreeMap<usize, Option<u64>>, index: usize, file_size: u64) -> Result<(u64, u64)> {
    let start = found.get(&index).copied().flatten().ok_or_else(|| {
        Error::Internal(format!("offset for row {index} was not loaded"))
    })?;
    let end = found.get(&(index + 1)).copied().flatten().unwrap_or(file_size);
    if end < start || end > file_size {
        return Err(OffsetsError::OutOfBounds {
            index,
            value: start,
            file_size,
        }
        .into());
    }
    Ok((start, end))
}

fn check_row_size(length: u64, max_bytes: u64, index: usize) -> Result<()> {
    if length > max_bytes {
        return Err(RowError::Oversize {
            bytes: length,
            limit: max_bytes,
            context: format!("row {index}"),
        }
        .into());
    }
    Ok(())
}

/// Parse one JSONL line, trailing newline optional
pub(crate) fn parse_value(bytes: &[u8], index: usize) -> Result<Value> {
    let line = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    serde_json::from_slice(line).map_err(|e| {
        RowError::Malformed {
            index,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Parse one JSONL line into a row, checking required keys
pub(crate) fn parse_row(bytes: &[u8], index: usize, required_keys: &[String]) -> Result<Row> {
    let Value::Object(row) = parse_value(bytes, index)? else {
        return Err(RowError::NotAnObject { index }.into());
    };
    check_required_keys(&row, index, required_keys)?;
    Ok(row)
}

pub(crate) fn check_required_keys(row: &Row, index: usize, required_keys: &[String]) -> Result<()> {
    let missing: Vec<String> = required_keys
        .iter()
        .filter(|key| !row.contains_key(key.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(RowError::MissingKeys { index, keys: missing }.into());
    }
    Ok(())
}

struct Batch {
    start: u64,
    end: u64,
    rows: Vec<(usize, u64, u64)>,
}

fn coalesce(ranges: &BTreeMap<usize, (u64, u64)>) -> Vec<Batch> {
    let mut sorted: Vec<(usize, u64, u64)> = ranges.iter().map(|(&i, &(s, e))| (i, s, e)).collect();
    sorted.sort_by_key(|&(_, start, _)| start);

    let mut batches: Vec<Batch> = Vec::new();
    for (index, start, end) in sorted {
        if let Some(batch) = batches.last_mut() {
            let near = start <= batch.end + COALESCE_GAP_BYTES;
            let fits = end.max(batch.end) - batch.start <= MAX_BATCH_READ_BYTES;
            if near && fits {
                batch.end = batch.end.max(end);
                batch.rows.push((index, start, end));
                continue;
            }
        }
        batches.push(Batch {
            start,
            end,
            rows: vec![(index, start, end)],
        });
    }
    batches
}
