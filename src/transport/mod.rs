//! Transport layer for the relay protocol.
//!
//! This module provides the wire protocol, the envelope codec that applies
//! the encryption capability, and the TCP connection primitives every other
//! component issues its requests through.

pub mod codec;
pub mod connection;
pub mod protocol;

pub use codec::MessageCodec;
pub use connection::{bind, notify_once, request_once, serve, Connection, FrameHandler};
pub use protocol::*;
