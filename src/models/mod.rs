//! Data shapes for the chunked upload service.
//!
//! `chunk` holds the wire envelope and replies, `session` the server-side
//! accumulation state, `object` what ends up in the storage sink.

pub mod chunk;
pub mod object;
pub mod session;
