//! termshare-protocol: Line protocol shared by the termshare host and clients
//!
//! Defines the newline-delimited message vocabulary exchanged over a TCP
//! stream and the stateful codecs that frame it.

pub mod codec;
pub mod messages;

pub use codec::{ClientCodec, CodecError, ServerCodec, DEFAULT_MAX_LINE_LENGTH};
pub use messages::{
    ClientMessage, ControlVerb, ProtocolError, ServerMessage, ACCEPT_TOKEN, REJECT_TOKEN,
};
