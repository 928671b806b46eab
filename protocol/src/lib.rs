//! Framed binary wire protocol for the tracking relay.
//!
//! Pure encode/decode, position-addressable, no I/O. Every message type's
//! functions take a caller-owned buffer and an offset; nothing here holds
//! message memory beyond the reusable [`text::Utf8Decoder`] scratch buffer.

pub mod device_id;
pub mod error;
pub mod header;
pub mod message_id;
pub mod messages;
pub mod resync;
pub mod text;
pub mod tlv;

pub use device_id::DeviceId;
pub use error::{InvalidUtf8, ParseError, ParseResult};
pub use header::{Header, HEADER_LEN, MAX_MESSAGE_SIZE};
pub use message_id::MessageId;
pub use tlv::{FieldId, TlvField, TlvFieldOwned};
