//! Line-protocol message types
//!
//! Every message is a single newline-terminated UTF-8 line. Three shapes exist:
//! handshake lines (`HELLO <username>`, `WELCOME <session-id>`), control lines
//! (`type=<verb>`) and everything else, which is plain data.

use std::fmt;
use std::str::FromStr;

/// Handshake verb sent by a connecting peer
pub const HELLO: &str = "HELLO";
/// Handshake verb sent by the server on acceptance
pub const WELCOME: &str = "WELCOME";
/// Key of a control line
pub const CONTROL_KEY: &str = "type";
/// Host answer granting a pending control request
pub const ACCEPT_TOKEN: &str = "y";
/// Host answer denying a pending control request
pub const REJECT_TOKEN: &str = "n";

/// Errors produced while parsing a single line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown control verb: {0:?}")]
    UnknownControlVerb(String),

    #[error("malformed control line: {0:?}")]
    MalformedControl(String),

    #[error("expected {expected} handshake line, got {line:?}")]
    MalformedHandshake { expected: &'static str, line: String },
}

/// Closed vocabulary of control verbs carried as `type=<verb>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlVerb {
    /// Username collision during handshake
    ClientNameTaken,
    /// Peer asks to become the editor
    RequestControl,
    /// Request accepted
    GrantControl,
    /// Request rejected
    DenyControl,
    /// Peer relinquishes the editor role
    GiveBackControl,
    /// Relinquish acknowledged (or host told it lost the editor role)
    ControlGivenBack,
    /// Leave the session; from the host, shut the server down
    Quit,
    /// Leave acknowledged
    QuitApproved,
}

impl ControlVerb {
    /// Wire name of the verb
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlVerb::ClientNameTaken => "client_name_taken",
            ControlVerb::RequestControl => "request_control",
            ControlVerb::GrantControl => "grant_control",
            ControlVerb::DenyControl => "deny_control",
            ControlVerb::GiveBackControl => "give_back_control",
            ControlVerb::ControlGivenBack => "control_given_back",
            ControlVerb::Quit => "quit",
            ControlVerb::QuitApproved => "quit_approved",
        }
    }
}

impl fmt::Display for ControlVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlVerb {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = match s {
            "client_name_taken" => ControlVerb::ClientNameTaken,
            "request_control" => ControlVerb::RequestControl,
            "grant_control" => ControlVerb::GrantControl,
            "deny_control" => ControlVerb::DenyControl,
            "give_back_control" => ControlVerb::GiveBackControl,
            "control_given_back" => ControlVerb::ControlGivenBack,
            "quit" => ControlVerb::Quit,
            "quit_approved" => ControlVerb::QuitApproved,
            other => return Err(ProtocolError::UnknownControlVerb(other.to_string())),
        };
        Ok(verb)
    }
}

/// Classify a session-phase line as control or data.
///
/// Only lines whose key is exactly `type` are control lines, so shell input
/// such as `FOO=bar` stays data.
fn parse_control(line: &str) -> Option<Result<ControlVerb, ProtocolError>> {
    let trimmed = line.trim();
    let (key, value) = trimmed.split_once('=')?;
    if key != CONTROL_KEY {
        return None;
    }
    if value.contains('=') {
        return Some(Err(ProtocolError::MalformedControl(trimmed.to_string())));
    }
    Some(value.parse())
}

/// Split a `VERB payload` handshake line
fn parse_handshake<'a>(line: &'a str, verb: &'static str) -> Result<&'a str, ProtocolError> {
    let trimmed = line.trim();
    match trimmed.split_once(' ') {
        Some((head, payload)) if head == verb => Ok(payload.trim_start()),
        _ => Err(ProtocolError::MalformedHandshake {
            expected: verb,
            line: trimmed.to_string(),
        }),
    }
}

/// Lines sent from a peer to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `HELLO <username>`
    Hello { username: String },
    /// `type=<verb>`
    Control(ControlVerb),
    /// Keystrokes, or the host's `y`/`n` decision; kept verbatim
    Data(String),
}

impl ClientMessage {
    /// Parse the handshake line a peer must send first
    pub fn parse_hello(line: &str) -> Result<Self, ProtocolError> {
        parse_handshake(line, HELLO).map(|username| ClientMessage::Hello {
            username: username.to_string(),
        })
    }

    /// Parse a line received after the handshake
    pub fn parse_session(line: &str) -> Result<Self, ProtocolError> {
        match parse_control(line) {
            Some(verb) => verb.map(ClientMessage::Control),
            None => Ok(ClientMessage::Data(line.to_string())),
        }
    }

    /// Returns the host decision carried by this line, if it is one
    pub fn as_decision(&self) -> Option<bool> {
        match self {
            ClientMessage::Data(text) => match text.trim() {
                ACCEPT_TOKEN => Some(true),
                REJECT_TOKEN => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::Hello { username } => write!(f, "{} {}", HELLO, username),
            ClientMessage::Control(verb) => write!(f, "{}={}", CONTROL_KEY, verb),
            ClientMessage::Data(text) => f.write_str(text),
        }
    }
}

/// Lines sent from the server to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `WELCOME <session-id>`
    Welcome { session_id: String },
    /// `type=<verb>`
    Control(ControlVerb),
    /// Shell output or a broadcast notice
    Text(String),
}

impl ServerMessage {
    /// Parse the server's reply to `HELLO`
    ///
    /// The reply is either `WELCOME <id>` or `type=client_name_taken`.
    pub fn parse_ack(line: &str) -> Result<Self, ProtocolError> {
        if let Some(verb) = parse_control(line) {
            return verb.map(ServerMessage::Control);
        }
        parse_handshake(line, WELCOME).map(|id| ServerMessage::Welcome {
            session_id: id.to_string(),
        })
    }

    /// Parse a line received after the handshake
    pub fn parse_session(line: &str) -> Result<Self, ProtocolError> {
        match parse_control(line) {
            Some(verb) => verb.map(ServerMessage::Control),
            None => Ok(ServerMessage::Text(line.to_string())),
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Welcome { session_id } => write!(f, "{} {}", WELCOME, session_id),
            ServerMessage::Control(verb) => write!(f, "{}={}", CONTROL_KEY, verb),
            ServerMessage::Text(text) => f.write_str(text),
        }
    }
}
