//! CBOR codec for tsh messages.
//!
//! One transport frame carries one CBOR-encoded value; framing is the
//! transport's job, so there is no length prefix.

use crate::error::{TshError, TshResult};
use crate::message::ShellMessage;
use std::io::Cursor;

/// Largest frame accepted by [`decode`] (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value as a CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> TshResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR payload into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TshResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Encode a message into a frame.
pub fn encode(message: &ShellMessage) -> TshResult<Vec<u8>> {
    let frame = cbor_encode(message)?;
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TshError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    Ok(frame)
}

/// Decode a frame into a message. Empty, oversized or malformed frames are errors.
pub fn decode(frame: &[u8]) -> TshResult<ShellMessage> {
    if frame.is_empty() {
        return Err(TshError::Codec("empty frame".into()));
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TshError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    cbor_decode(frame)
}
