//! Length-prefixed msgpack framing.
//!
//! Every structured frame is an 8-byte little-endian payload length
//! followed by the msgpack payload. Raw single-byte acks bypass this
//! module entirely.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Size of the length prefix preceding every structured frame.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Hard cap on a single frame payload. The largest legitimate frame is an
/// enriched search config, bounded well below this by the job table's
/// blob column.
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024;

/// Wrap an already-encoded payload in a length prefix.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len() as u64;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.write_u64::<LittleEndian>(len)?;
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encode a message as msgpack (string-keyed map) and frame it.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(message)?;
    frame_payload(&payload)
}

/// Parse a length prefix, validating it against [`MAX_FRAME_SIZE`].
pub fn read_frame_len(prefix: &[u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let len = LittleEndian::read_u64(prefix);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            got: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len as usize)
}

/// Decode a frame payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}
