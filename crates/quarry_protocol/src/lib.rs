//! Reducer Rendezvous Protocol
//!
//! Wire format for Scheduler <-> Reducer communication, plus the canonical
//! job/task types shared across the Quarry search platform.
//!
//! # Protocol Specification
//!
//! Every structured message is an 8-byte little-endian length prefix
//! followed by a msgpack-encoded map. Acknowledgements are a single raw
//! byte (no prefix); EOF in place of an ack means the reducer declined or
//! died.
//!
//! ```text
//! 1. reducer -> scheduler   [LEN:8][{host, port}]
//! 2. scheduler -> reducer   [LEN:8][SearchConfig + job_id/reducer_host/reducer_port]
//! 3. reducer -> scheduler   1 raw byte (start ack)
//! 4. scheduler -> reducer   [LEN:8][{done: true}]
//! 5. reducer -> scheduler   1 raw byte (final ack)
//! ```
//!
//! The scheduler closes the connection after step 5 or at any earlier
//! protocol violation.

pub mod defaults;
pub mod error;
pub mod types;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use types::{
    JobId, JobStatus, ReducerDone, ReducerHello, SearchConfig, SearchTaskResult, TaskStatus,
};
pub use wire::{decode_payload, encode_frame, frame_payload, read_frame_len, LENGTH_PREFIX_SIZE};
