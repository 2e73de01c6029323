//! Client command parsing
//!
//! Three exact slash commands map to control lines. Any other input,
//! including paths such as `/bin/ls`, is regular shell input.

use termshare_protocol::ControlVerb;

/// Parsed client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `/request_control`
    RequestControl,
    /// `/give_back_control`
    GiveBackControl,
    /// `/quit`
    Quit,
}

impl Command {
    /// Control verb sent for this command
    pub fn verb(self) -> ControlVerb {
        match self {
            Command::RequestControl => ControlVerb::RequestControl,
            Command::GiveBackControl => ControlVerb::GiveBackControl,
            Command::Quit => ControlVerb::Quit,
        }
    }
}

/// Usage line shown on connect
pub const USAGE: &str = "Commands: /request_control, /give_back_control, /quit";

/// Parse a console line as a command
///
/// Returns `None` for anything but the exact command words.
pub fn parse_command(input: &str) -> Option<Command> {
    match input.trim() {
        "/request_control" => Some(Command::RequestControl),
        "/give_back_control" => Some(Command::GiveBackControl),
        "/quit" => Some(Command::Quit),
        _ => None,
    }
}
