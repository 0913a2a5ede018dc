//! Length-delimited header framing.
//!
//! Each layer of the codec writes a 4-byte big-endian length, then a JSON
//! header of that length, then its body. Reading never trusts the length
//! beyond [`MAX_HEADER_SIZE`] or beyond the bytes actually present.

use crate::error::{CodecError, CodecResult};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum header size (64 KB).
pub(crate) const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Appends a length-prefixed JSON header to `out`.
pub(crate) fn write_header<H: Serialize>(out: &mut Vec<u8>, header: &H) -> CodecResult<()> {
    let data = serde_json::to_vec(header)
        .map_err(|e| CodecError::Encode(format!("header encode error: {e}")))?;
    if data.len() > MAX_HEADER_SIZE {
        return Err(CodecError::Encode(format!(
            "header too large: {} bytes",
            data.len()
        )));
    }
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&data);
    Ok(())
}

/// Splits a framed buffer into its parsed header and the remaining body.
pub(crate) fn read_header<H: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(H, &[u8])> {
    if bytes.len() < 4 {
        return Err(CodecError::decode(format!(
            "truncated frame: {} bytes, need at least 4",
            bytes.len()
        )));
    }
    let (len_bytes, rest) = bytes.split_at(4);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

    if len > MAX_HEADER_SIZE {
        return Err(CodecError::decode(format!("header too large: {len} bytes")));
    }
    if rest.len() < len {
        return Err(CodecError::decode(format!(
            "truncated header: declared {len} bytes, {} available",
            rest.len()
        )));
    }

    let (header_bytes, body) = rest.split_at(len);
    let header = serde_json::from_slice(header_bytes)
        .map_err(|e| CodecError::decode(format!("header decode error: {e}")))?;
    Ok((header, body))
}
