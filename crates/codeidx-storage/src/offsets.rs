//! Offsets sidecar codec
//!
//! A sidecar is a dense array of little-endian `u64` values, one per row,
//! each the byte position of that row's first byte in the JSONL file. There
//! is no header, footer or compression; the row count is `len / 8`.
//!
//! Well-formed sidecars satisfy:
//! - `offsets[0] == 0`
//! - offsets are strictly increasing and below the row file size
//! - the byte before every offset except the first is `\n`
//! - the row file ends with `\n`

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use codeidx_common::error::{Error, OffsetsError, Result};

/// Bytes per sidecar entry
pub const OFFSET_WIDTH: u64 = 8;

/// Largest offset a reader can represent exactly (2^53 - 1)
pub const MAX_SAFE_OFFSET: u64 = (1 << 53) - 1;

/// Spans of sidecar entries up to this size are fetched with a single read
pub const MAX_SPAN_READ_BYTES: u64 = 4 * 1024 * 1024;

const VALIDATE_CHUNK_BYTES: usize = 1024 * 1024;

/// Accumulates offsets while rows are appended to a JSONL buffer
#[derive(Debug, Default, Clone)]
pub struct OffsetsBuilder {
    offsets: Vec<u64>,
    position: u64,
}

impl OffsetsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a row of `line_len` bytes (newline included) at the current position
    pub fn push_line(&mut self, line_len: u64) {
        self.offsets.push(self.position);
        self.position += line_len;
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Bytes of row data recorded so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.offsets)
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.position = 0;
    }
}

/// Encode offsets as a raw `u64` little-endian array
pub fn encode(offsets: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(offsets.len() * OFFSET_WIDTH as usize);
    for offset in offsets {
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out
}

/// Decode a raw sidecar buffer
pub fn decode(bytes: &[u8], label: &str) -> Result<Vec<u64>> {
    check_alignment(bytes.len() as u64, label)?;
    bytes
        .chunks_exact(OFFSET_WIDTH as usize)
        .enumerate()
        .map(|(index, chunk)| entry_value(index, chunk))
        .collect()
}

fn entry_value(index: usize, chunk: &[u8]) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(chunk);
    let value = u64::from_le_bytes(raw);
    if value > MAX_SAFE_OFFSET {
        return Err(OffsetsError::UnsafeOffset { index, value }.into());
    }
    Ok(value)
}

fn check_alignment(len: u64, label: &str) -> Result<()> {
    if len % OFFSET_WIDTH != 0 {
        return Err(OffsetsError::Misaligned {
            path: label.to_string(),
            len,
        }
        .into());
    }
    Ok(())
}

/// Read every offset in a sidecar
pub async fn read_all(path: &Path) -> Result<Vec<u64>> {
    let bytes = tokio::fs::read(path).await?;
    decode(&bytes, &path.display().to_string())
}

/// Row count of a sidecar, from its size alone
pub async fn count(path: &Path) -> Result<u64> {
    let len = tokio::fs::metadata(path).await?.len();
    check_alignment(len, &path.display().to_string())?;
    Ok(len / OFFSET_WIDTH)
}

/// Look up offsets for a set of row indexes.
///
/// Indexes past the end of the sidecar map to `None`. Nearby indexes are
/// served from one contiguous read.
pub async fn read_at(path: &Path, indexes: &[usize]) -> Result<BTreeMap<usize, Option<u64>>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    check_alignment(len, &path.display().to_string())?;
    read_at_in(&mut file, len / OFFSET_WIDTH, indexes).await
}

pub(crate) async fn read_at_in(
    file: &mut File,
    total: u64,
    indexes: &[usize],
) -> Result<BTreeMap<usize, Option<u64>>> {
    let mut result: BTreeMap<usize, Option<u64>> = indexes.iter().map(|&i| (i, None)).collect();
    let wanted: Vec<usize> = result
        .keys()
        .copied()
        .filter(|&i| (i as u64) < total)
        .collect();
    let (Some(&min), Some(&max)) = (wanted.first(), wanted.last()) else {
        return Ok(result);
    };

    let span = (max - min + 1) as u64 * OFFSET_WIDTH;
    if span <= MAX_SPAN_READ_BYTES {
        let buf = read_exact_at(file, min as u64 * OFFSET_WIDTH, span).await?;
        for index in wanted {
            let start = (index - min) * OFFSET_WIDTH as usize;
            let value = entry_value(index, &buf[start..start + OFFSET_WIDTH as usize])?;
            result.insert(index, Some(value));
        }
    } else {
        for index in wanted {
            let buf = read_exact_at(file, index as u64 * OFFSET_WIDTH, OFFSET_WIDTH).await?;
            result.insert(index, Some(entry_value(index, &buf)?));
        }
    }
    Ok(result)
}

/// Read exactly `len` bytes at `start`
pub(crate) async fn read_exact_at(file: &mut File, start: u64, len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| {
        Error::InvalidParameter(format!("read length {len} does not fit in memory"))
    })?;
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(start)).await?;
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Summary of a successful validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedOffsets {
    pub rows: u64,
    pub file_size: u64,
}

/// Check a sidecar against its row file.
///
/// Both files are opened for this call only and closed on every return path.
pub async fn validate_against_file(jsonl_path: &Path, offsets_path: &Path) -> Result<ValidatedOffsets> {
    let (offsets, mut jsonl) = tokio::try_join!(read_all(offsets_path), async {
        File::open(jsonl_path).await.map_err(Error::from)
    })?;
    let file_size = jsonl.metadata().await?.len();

    if offsets.is_empty() {
        if file_size != 0 {
            return Err(OffsetsError::Empty { file_size }.into());
        }
        return Ok(ValidatedOffsets { rows: 0, file_size });
    }
    check_monotonic(&offsets, file_size)?;

    // Positions that must hold a newline, ascending: the byte before each
    // row start (except the first) and the final byte of the file.
    let boundaries = offsets
        .iter()
        .enumerate()
        .skip(1)
        .map(|(index, &value)| (Some(index), value - 1))
        .chain(std::iter::once((None, file_size - 1)));

    let mut buf = vec![0u8; VALIDATE_CHUNK_BYTES];
    let mut chunk_start = 0u64;
    let mut chunk_len = 0usize;
    for (index, position) in boundaries {
        if position < chunk_start || position >= chunk_start + chunk_len as u64 {
            jsonl.seek(SeekFrom::Start(position)).await?;
            chunk_start = position;
            chunk_len = fill(&mut jsonl, &mut buf).await?;
        }
        let byte = if chunk_len == 0 {
            None
        } else {
            Some(buf[(position - chunk_start) as usize])
        };
        if byte != Some(b'\n') {
            return Err(match index {
                Some(index) => OffsetsError::MissingNewlineBoundary {
                    index,
                    value: offsets[index],
                },
                None => OffsetsError::MissingTrailingNewline {
                    path: jsonl_path.display().to_string(),
                },
            }
            .into());
        }
    }

    Ok(ValidatedOffsets {
        rows: offsets.len() as u64,
        file_size,
    })
}

fn check_monotonic(offsets: &[u64], file_size: u64) -> Result<()> {
    if offsets[0] != 0 {
        return Err(OffsetsError::NonZeroStart { value: offsets[0] }.into());
    }
    for (index, &value) in offsets.iter().enumerate() {
        if value >= file_size {
            return Err(OffsetsError::OutOfBounds {
                index,
                value,
                file_size,
            }
            .into());
        }
        if index > 0 && value <= offsets[index - 1] {
            return Err(OffsetsError::NotIncreasing {
                index,
                prev: offsets[index - 1],
                value,
            }
            .into());
        }
    }
    Ok(())
}

/// Read until `buf` is full or EOF
async fn fill(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
