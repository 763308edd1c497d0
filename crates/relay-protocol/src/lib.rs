//! Relay Protocol - Wire protocol for client/server communication
//!
//! Every frame is a 1-byte kind tag, a 4-byte native-endian length and,
//! when the length is non-zero, `length` payload bytes followed by a NUL.

pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtocolError;
pub use frame::{read_message, write_message, MAX_PAYLOAD_LEN};
pub use message::{MessageKind, WireMessage};
