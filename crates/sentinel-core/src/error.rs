//! Error types for sentinel-core.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too large: {size} > {max}")] TooLarge { size: usize, max: usize },
    #[error("encode: {0}")] Encode(String),
    #[error("decode: {0}")] Decode(String),
    #[error("{0} trailing bytes after value")] TrailingBytes(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("unknown network: {0}")] UnknownNetwork(String),
    #[error("invalid hex: {0}")] InvalidHex(String),
}
