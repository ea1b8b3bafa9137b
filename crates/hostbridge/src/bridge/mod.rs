//! Wire layer between the engine and the backend.
//!
//! # Architecture
//!
//! - **protocol**: Message types (`Message`, `Mode`, `Target`, `ErrorDescriptor`)
//! - **codec**: length-prefixed text framing for AsyncRead/AsyncWrite
//! - **transport**: frame source/sink traits and the memory, framed and
//!   WebSocket implementations

pub mod codec;
pub mod protocol;
pub mod transport;
