//! Per-object compression of stored chunks

use crate::error::{PipelineError, Result};
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Zstd level used when writing chunks
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to every chunk object of a scale.
///
/// Stored as the scale's `"compression"` field and omitted when `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    /// gzip, as object stores serve with `Content-Encoding: gzip`
    Gzip,
    Zstd,
}

impl CompressionMethod {
    pub fn is_none(&self) -> bool {
        *self == CompressionMethod::None
    }

    /// Compress an encoded chunk
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let packed = match self {
            CompressionMethod::None => return Ok(raw.to_vec()),
            CompressionMethod::Gzip => {
                let mut packed = Vec::new();
                GzEncoder::new(raw, Compression::default())
                    .read_to_end(&mut packed)
                    .map(|_| packed)
            }
            CompressionMethod::Zstd => zstd::encode_all(raw, ZSTD_LEVEL),
        };
        packed.map_err(|e| PipelineError::Compression(format!("{:?}: {}", self, e)))
    }

    /// Decompress a stored chunk; `raw_len` is a capacity hint
    pub fn decompress(&self, stored: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let raw = match self {
            CompressionMethod::None => return Ok(stored.to_vec()),
            CompressionMethod::Gzip => {
                let mut raw = Vec::with_capacity(raw_len);
                GzDecoder::new(stored).read_to_end(&mut raw).map(|_| raw)
            }
            CompressionMethod::Zstd => zstd::decode_all(stored),
        };
        raw.map_err(|e| PipelineError::Decompression(format!("{:?}: {}", self, e)))
    }
}
