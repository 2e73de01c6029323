//! Line codecs for the termshare wire protocol
//!
//! Both codecs are stateful: a connection starts in the handshake phase, where
//! the first line must be `HELLO` (server side) or the `WELCOME` /
//! `client_name_taken` reply (client side), and moves to the session phase
//! once that line decodes successfully.
//!
//! Items are `Result<Message, ProtocolError>`: a malformed line is reported
//! without ending the stream, while transport faults and over-long lines are
//! returned as [`CodecError`] and do end it.
//!
//! Lines are split on `\n` at the byte level. Bytes that are not valid UTF-8
//! are replaced with U+FFFD rather than rejected.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use crate::messages::{ClientMessage, ProtocolError, ServerMessage};

/// Maximum line length accepted by default (64 KiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line too long (max {max} bytes)")]
    LineTooLong { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Session,
}

fn line_splitter(max_length: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length)
}

fn lines_error(err: AnyDelimiterCodecError, max: usize) -> CodecError {
    match err {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => CodecError::LineTooLong { max },
        AnyDelimiterCodecError::Io(e) => CodecError::Io(e),
    }
}

/// Decode one raw line, dropping a trailing `\r`
fn to_line(raw: Bytes) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
    String::from_utf8_lossy(raw).into_owned()
}

/// Codec for ClientMessage (decoding) and ServerMessage (encoding)
/// Used by the server side
#[derive(Debug)]
pub struct ServerCodec {
    lines: AnyDelimiterCodec,
    max_length: usize,
    phase: Phase,
}

impl ServerCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: line_splitter(max_length),
            max_length,
            phase: Phase::Handshake,
        }
    }

    fn parse(&mut self, line: String) -> Result<ClientMessage, ProtocolError> {
        match self.phase {
            Phase::Handshake => {
                let msg = ClientMessage::parse_hello(&line)?;
                self.phase = Phase::Session;
                Ok(msg)
            }
            Phase::Session => ClientMessage::parse_session(&line),
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ServerCodec {
    type Item = Result<ClientMessage, ProtocolError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_length;
        match self.lines.decode(src).map_err(|e| lines_error(e, max))? {
            Some(raw) => Ok(Some(self.parse(to_line(raw)))),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_length;
        match self.lines.decode_eof(src).map_err(|e| lines_error(e, max))? {
            Some(raw) => Ok(Some(self.parse(to_line(raw)))),
            None => Ok(None),
        }
    }
}

impl Encoder<ServerMessage> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let max = self.max_length;
        self.lines
            .encode(item.to_string(), dst)
            .map_err(|e| lines_error(e, max))
    }
}

/// Codec for ServerMessage (decoding) and ClientMessage (encoding)
/// Used by the client side
#[derive(Debug)]
pub struct ClientCodec {
    lines: AnyDelimiterCodec,
    max_length: usize,
    phase: Phase,
}

impl ClientCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: line_splitter(max_length),
            max_length,
            phase: Phase::Handshake,
        }
    }

    fn parse(&mut self, line: String) -> Result<ServerMessage, ProtocolError> {
        match self.phase {
            Phase::Handshake => {
                let msg = ServerMessage::parse_ack(&line)?;
                if matches!(msg, ServerMessage::Welcome { .. }) {
                    self.phase = Phase::Session;
                }
                Ok(msg)
            }
            Phase::Session => ServerMessage::parse_session(&line),
        }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ClientCodec {
    type Item = Result<ServerMessage, ProtocolError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_length;
        match self.lines.decode(src).map_err(|e| lines_error(e, max))? {
            Some(raw) => Ok(Some(self.parse(to_line(raw)))),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let max = self.max_length;
        match self.lines.decode_eof(src).map_err(|e| lines_error(e, max))? {
            Some(raw) => Ok(Some(self.parse(to_line(raw)))),
            None => Ok(None),
        }
    }
}

impl Encoder<ClientMessage> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let max = self.max_length;
        self.lines
            .encode(item.to_string(), dst)
            .map_err(|e| lines_error(e, max))
    }
}
