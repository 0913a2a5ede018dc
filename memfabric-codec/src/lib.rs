//! Serialization and compression for memory fabric payloads.
//!
//! A stored payload is two nested frames:
//!
//! ```text
//! [u32][CompressionHeader]  ── compressor layer ──┐
//!     [u32][PayloadHeader]  ── serializer layer   │ (possibly zstd-compressed)
//!         [json body]                             ┘
//! ```
//!
//! Both headers are length-delimited JSON, so a payload can be decoded
//! without any outside context.
//!
//! # Example
//!
//! ```
//! use memfabric_codec::{Codec, CodecConfig};
//! use memfabric_types::Value;
//!
//! let codec = Codec::new(CodecConfig::default());
//! let value = Value::map([("name", Value::from("alice"))]);
//! let encoded = codec.encode(&value).unwrap();
//! assert_eq!(codec.decode(&encoded.bytes).unwrap(), value);
//! ```

mod compressor;
mod error;
mod frame;
mod serializer;

pub use compressor::{
    Algorithm, BatchReport, CodecConfig, Compressed, CompressionHeader, Compressor,
    peek_compression,
};
pub use error::{CodecError, CodecResult};
pub use serializer::{
    Encoding, FORMAT_VERSION, MAX_NESTING_DEPTH, PayloadHeader, decode, encode, peek_header,
};

use memfabric_types::Value;

/// Serializer and compressor combined: values in, stored bytes out.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    compressor: Compressor,
}

/// A value encoded for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// Bytes to store; `bytes.len()` is the accounted size.
    pub bytes: Vec<u8>,
    /// Size of the serialized value before compression.
    pub serialized_size: usize,
    pub algorithm: Algorithm,
    pub ratio: f64,
    /// Compression failed and the serialized bytes were kept raw.
    pub fell_back: bool,
}

impl Codec {
    /// Creates a codec with the given compression settings.
    pub fn new(config: CodecConfig) -> Self {
        Self {
            compressor: Compressor::new(config),
        }
    }

    /// Returns the underlying compressor.
    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Serializes and (optionally) compresses a value.
    pub fn encode(&self, value: &Value) -> CodecResult<Encoded> {
        let serialized = encode(value)?;
        let compressed = self.compressor.compress(&serialized)?;
        Ok(Encoded {
            serialized_size: serialized.len(),
            bytes: compressed.bytes,
            algorithm: compressed.algorithm,
            ratio: compressed.ratio,
            fell_back: compressed.fell_back,
        })
    }

    /// Decompresses and deserializes stored bytes.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        let serialized = self.compressor.decompress(bytes)?;
        decode(&serialized)
    }
}
