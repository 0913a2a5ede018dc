//! Payload compression.
//!
//! Every compressed frame is `[u32 len][CompressionHeader json][body]`.
//! Small inputs (below the threshold) and inputs that do not shrink by at
//! least `min_ratio` are framed raw with [`Algorithm::None`]. The header
//! keeps the original length and an xxh3 checksum so a damaged body is
//! reported as a decode error instead of handed back as garbage.

use crate::error::{CodecError, CodecResult};
use crate::frame::{read_header, write_header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Largest decompressed size a header may claim (256 MB).
const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Compression algorithm recorded in a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Stored as-is.
    None,
    #[default]
    Zstd,
}

/// Header written ahead of every compressed (or raw-framed) body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionHeader {
    pub algorithm: Algorithm,
    /// `original_size / body_size`; `1.0` for raw frames.
    pub ratio: f64,
    pub original_size: usize,
    pub checksum: u64,
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Whether to attempt compression at all.
    pub compression_enabled: bool,
    /// Inputs smaller than this many bytes are never compressed.
    pub compression_threshold: usize,
    /// Minimum `original / compressed` ratio worth keeping.
    pub min_ratio: f64,
    /// zstd level.
    pub level: i32,
    pub algorithm: Algorithm,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold: 1024,
            min_ratio: 1.1,
            level: 3,
            algorithm: Algorithm::Zstd,
        }
    }
}

/// Outcome of compressing one buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    /// Framed bytes, ready to store.
    pub bytes: Vec<u8>,
    pub algorithm: Algorithm,
    pub ratio: f64,
    pub original_size: usize,
    /// True when compression was attempted but failed and raw bytes were kept.
    pub fell_back: bool,
}

/// Counts from [`Compressor::compress_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Inputs stored compressed.
    pub succeeded: usize,
    /// Inputs where the backend failed and raw bytes were kept.
    pub failed: usize,
    /// Inputs stored raw by choice (below threshold or poor ratio).
    pub skipped: usize,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

/// Applies the configured compression policy to byte buffers.
#[derive(Debug, Clone, Default)]
pub struct Compressor {
    config: CodecConfig,
}

impl Compressor {
    /// Creates a compressor with the given settings.
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Returns the settings in use.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Compresses `data` if worthwhile and frames the result.
    ///
    /// Backend failures never fail the call: the data is framed raw and
    /// `fell_back` is set so the caller can report it.
    pub fn compress(&self, data: &[u8]) -> CodecResult<Compressed> {
        let checksum = xxh3_64(data);

        let wants_compression = self.config.compression_enabled
            && self.config.algorithm != Algorithm::None
            && data.len() >= self.config.compression_threshold;
        if !wants_compression {
            return raw_frame(data, checksum, false);
        }

        let body = match zstd::bulk::compress(data, self.config.level) {
            Ok(body) => body,
            Err(e) => {
                warn!("compression failed, storing raw: {e}");
                return raw_frame(data, checksum, true);
            }
        };

        let ratio = if body.is_empty() {
            1.0
        } else {
            data.len() as f64 / body.len() as f64
        };
        if ratio < self.config.min_ratio {
            debug!("compression ratio {ratio:.2} below {}, storing raw", self.config.min_ratio);
            return raw_frame(data, checksum, false);
        }

        let header = CompressionHeader {
            algorithm: Algorithm::Zstd,
            ratio,
            original_size: data.len(),
            checksum,
        };
        let mut bytes = Vec::with_capacity(body.len() + 96);
        write_header(&mut bytes, &header)?;
        bytes.extend_from_slice(&body);

        Ok(Compressed {
            bytes,
            algorithm: Algorithm::Zstd,
            ratio,
            original_size: data.len(),
            fell_back: false,
        })
    }

    /// Reverses [`compress`](Self::compress). Any inconsistency between the
    /// header and the body is a [`CodecError::Decode`].
    pub fn decompress(&self, framed: &[u8]) -> CodecResult<Vec<u8>> {
        let (header, body): (CompressionHeader, &[u8]) = read_header(framed)?;
        if header.original_size > MAX_PAYLOAD_SIZE {
            return Err(CodecError::decode(format!(
                "declared size {} exceeds limit",
                header.original_size
            )));
        }

        let data = match header.algorithm {
            Algorithm::None => body.to_vec(),
            Algorithm::Zstd => zstd::bulk::decompress(body, header.original_size)
                .map_err(|e| CodecError::decode(format!("zstd: {e}")))?,
        };

        if data.len() != header.original_size {
            return Err(CodecError::decode(format!(
                "length mismatch: header says {}, got {}",
                header.original_size,
                data.len()
            )));
        }
        if xxh3_64(&data) != header.checksum {
            return Err(CodecError::decode("checksum mismatch"));
        }
        Ok(data)
    }

    /// Compresses many buffers, reporting counts instead of stopping at the
    /// first problem.
    pub fn compress_batch<'a, I>(&self, items: I) -> (Vec<CodecResult<Compressed>>, BatchReport)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut report = BatchReport::default();
        let results = items
            .into_iter()
            .map(|data| {
                report.bytes_in += data.len();
                let result = self.compress(data);
                match &result {
                    Ok(c) if c.fell_back => report.failed += 1,
                    Ok(c) if c.algorithm == Algorithm::None => report.skipped += 1,
                    Ok(_) => report.succeeded += 1,
                    Err(_) => report.failed += 1,
                }
                if let Ok(c) = &result {
                    report.bytes_out += c.bytes.len();
                }
                result
            })
            .collect();
        (results, report)
    }
}

fn raw_frame(data: &[u8], checksum: u64, fell_back: bool) -> CodecResult<Compressed> {
    let header = CompressionHeader {
        algorithm: Algorithm::None,
        ratio: 1.0,
        original_size: data.len(),
        checksum,
    };
    let mut bytes = Vec::with_capacity(data.len() + 96);
    write_header(&mut bytes, &header)?;
    bytes.extend_from_slice(data);
    Ok(Compressed {
        bytes,
        algorithm: Algorithm::None,
        ratio: 1.0,
        original_size: data.len(),
        fell_back,
    })
}

/// Reads the compression header without decompressing.
pub fn peek_compression(framed: &[u8]) -> CodecResult<CompressionHeader> {
    read_header(framed).map(|(header, _)| header)
}
