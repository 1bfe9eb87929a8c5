//! Whole-file compression codecs for artifact files

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use codeidx_common::error::{Error, Result, RowError};
use codeidx_common::types::Compression;

const ZSTD_LEVEL: i32 = 3;

/// Compress a complete file payload
pub fn encode(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity(data.len() / 4),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Zstd => Ok(zstd::encode_all(data, ZSTD_LEVEL)?),
    }
}

/// Decompress a complete file payload, refusing output larger than `max_bytes`
pub fn decode(data: &[u8], compression: Compression, max_bytes: u64) -> Result<Vec<u8>> {
    if max_bytes == 0 {
        return Err(Error::InvalidParameter(
            "decompression ceiling must be positive".to_string(),
        ));
    }
    let mut out = Vec::new();
    // One byte past the ceiling is enough to detect overflow.
    let limit = max_bytes.saturating_add(1);
    match compression {
        Compression::None => {
            if data.len() as u64 > max_bytes {
                return Err(too_large(data.len() as u64, max_bytes));
            }
            return Ok(data.to_vec());
        }
        Compression::Gzip => {
            GzDecoder::new(data).take(limit).read_to_end(&mut out)?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::new(data)?
                .take(limit)
                .read_to_end(&mut out)?;
        }
    }
    if out.len() as u64 > max_bytes {
        return Err(too_large(out.len() as u64, max_bytes));
    }
    Ok(out)
}

fn too_large(bytes: u64, limit: u64) -> Error {
    Error::Row(RowError::Oversize {
        bytes,
        limit,
        context: "decompressed artifact".to_string(),
    })
}
