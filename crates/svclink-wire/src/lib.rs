//! svclink wire layout — how addresses and service events cross a process
//! boundary.
//!
//! The router transport moves opaque byte buffers between processes. This
//! crate defines what goes inside them:
//!
//! - **stream**: the binary layout of service items and addresses
//! - **message**: tagged router messages (registrations and relayed events)
//!
//! Framing (length prefixes, sockets) belongs to the transport.

pub mod message;
pub mod stream;

pub use message::{decode_message, encode_message, RouterMessage};
pub use stream::{ReadStream, WireError, WriteStream};
