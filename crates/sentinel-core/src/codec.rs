//! Bounded bincode encoding shared by gossip payloads, RPC bodies and
//! discovery packets.
//!
//! Decoding runs with a byte limit so a forged length prefix inside a
//! payload cannot make the decoder allocate more than a full gossip message.

use bincode::config::Config;

use crate::constants::MAX_DECODE_BYTES;
use crate::error::CodecError;

fn wire_config() -> impl Config {
    bincode::config::standard().with_limit::<MAX_DECODE_BYTES>()
}

/// Encode a value with the wire configuration.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    let bytes =
        bincode::encode_to_vec(value, wire_config()).map_err(|e| CodecError::Encode(e.to_string()))?;
    if bytes.len() > MAX_DECODE_BYTES {
        return Err(CodecError::TooLarge { size: bytes.len(), max: MAX_DECODE_BYTES });
    }
    Ok(bytes)
}

/// Decode exactly one value from `bytes`.
///
/// Input larger than `max` is rejected before decoding starts, and any bytes
/// left over after the value are an error.
pub fn decode_bounded<T: bincode::Decode<()>>(bytes: &[u8], max: usize) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge { size: bytes.len(), max });
    }
    let (value, read): (T, usize) = bincode::decode_from_slice(bytes, wire_config())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}

/// Decode exactly one value, bounded by [`MAX_DECODE_BYTES`].
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, CodecError> {
    decode_bounded(bytes, MAX_DECODE_BYTES)
}
