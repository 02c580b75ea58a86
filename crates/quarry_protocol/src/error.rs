//! Protocol error types

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too large: {got} bytes exceeds limit of {max}")]
    FrameTooLarge { got: u64, max: u64 },

    #[error("Invalid job status code: {0}")]
    InvalidJobStatus(i64),

    #[error("Invalid task status code: {0}")]
    InvalidTaskStatus(i64),

    #[error("Search config is not a msgpack map")]
    NotAMap,

    #[error("Search config field `{field}` has an unexpected type")]
    FieldType { field: &'static str },

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("msgpack value read error: {0}")]
    ValueRead(#[from] rmpv::decode::Error),

    #[error("msgpack value write error: {0}")]
    ValueWrite(#[from] rmpv::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
