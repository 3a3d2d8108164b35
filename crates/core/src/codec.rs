#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Every persisted record is wrapped in a frame: a 4-byte big-endian payload
/// length followed by exactly that many payload bytes. Legacy blobs carry the
/// same frame, which is why decoding reads it explicitly instead of trusting
/// the slice length.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("record frame is truncated")]
    Truncated,
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(String),
}

pub fn encode_framed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one framed payload. Bytes past the declared length are ignored, the
/// way the legacy reader consumed them.
pub fn decode_framed(bytes: &[u8]) -> Result<&[u8], CodecError> {
    let header = bytes.get(..FRAME_HEADER_LEN).ok_or(CodecError::Truncated)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    bytes
        .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)
        .ok_or(CodecError::Truncated)
}

/// Encode a record as CBOR inside the standard frame.
pub fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload =
        minicbor_serde::to_vec(value).map_err(|error| CodecError::Encode(error.to_string()))?;
    Ok(encode_framed(&payload))
}

/// Decode a framed CBOR record.
pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let payload = decode_framed(bytes)?;
    minicbor_serde::from_slice(payload).map_err(|error| CodecError::Decode(error.to_string()))
}
