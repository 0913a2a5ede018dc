//! Value serialization with a self-describing header.
//!
//! Layout: `[u32 len][PayloadHeader json][body]`. The header names the
//! value's type tag, the format version, the body size and the body
//! encoding, so [`decode`] needs nothing but the bytes.

use crate::error::{CodecError, CodecResult};
use crate::frame::{read_header, write_header};
use memfabric_types::{Value, ValueKind};
use serde::{Deserialize, Serialize};

/// Current payload format version.
pub const FORMAT_VERSION: u8 = 1;

/// Deepest array/map nesting [`encode`] accepts.
///
/// Each container level costs two JSON levels in the body, and the JSON
/// reader stops at 128.
pub const MAX_NESTING_DEPTH: usize = 48;

/// Body encoding of a serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Json,
}

/// Metadata header written ahead of every serialized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadHeader {
    #[serde(rename = "type")]
    pub kind: ValueKind,
    pub version: u8,
    pub original_size: usize,
    pub encoding: Encoding,
}

/// Serializes a value into a self-describing byte payload.
pub fn encode(value: &Value) -> CodecResult<Vec<u8>> {
    check_representable(value, 0)?;

    let body = serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    let header = PayloadHeader {
        kind: value.kind(),
        version: FORMAT_VERSION,
        original_size: body.len(),
        encoding: Encoding::Json,
    };

    let mut out = Vec::with_capacity(body.len() + 96);
    write_header(&mut out, &header)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads only the header of a serialized payload.
pub fn peek_header(bytes: &[u8]) -> CodecResult<PayloadHeader> {
    read_header(bytes).map(|(header, _)| header)
}

/// Deserializes a payload produced by [`encode`].
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let (header, body): (PayloadHeader, &[u8]) = read_header(bytes)?;

    if header.version != FORMAT_VERSION {
        return Err(CodecError::decode(format!(
            "unsupported payload version {} (expected {FORMAT_VERSION})",
            header.version
        )));
    }
    if body.len() != header.original_size {
        return Err(CodecError::decode(format!(
            "body size mismatch: header says {}, found {}",
            header.original_size,
            body.len()
        )));
    }

    let value: Value = match header.encoding {
        Encoding::Json => serde_json::from_slice(body)
            .map_err(|e| CodecError::decode(format!("body decode error: {e}")))?,
    };

    if value.kind() != header.kind {
        return Err(CodecError::decode(format!(
            "type tag mismatch: header says {:?}, body is {:?}",
            header.kind,
            value.kind()
        )));
    }
    Ok(value)
}

/// Rejects values whose JSON body could not be read back exactly.
///
/// `depth` is the number of containers enclosing `value`.
fn check_representable(value: &Value, depth: usize) -> CodecResult<()> {
    match value {
        Value::Float(x) if !x.is_finite() => Err(CodecError::Encode(format!(
            "non-finite float {x} cannot be encoded"
        ))),
        Value::Array(_) | Value::Map(_) if depth >= MAX_NESTING_DEPTH => Err(CodecError::Encode(
            format!("value nests deeper than {MAX_NESTING_DEPTH} levels"),
        )),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_representable(item, depth + 1)),
        Value::Map(map) => map
            .values()
            .try_for_each(|item| check_representable(item, depth + 1)),
        _ => Ok(()),
    }
}
