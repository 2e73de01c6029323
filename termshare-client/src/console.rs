//! Line-oriented console
//!
//! Prints everything the server sends and turns typed lines into protocol
//! lines. Regular input is forwarded only while this client holds the editor
//! role; the host console may additionally always answer control requests.

use std::io::{BufRead, Write};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use termshare_protocol::{ClientMessage, ControlVerb, ServerMessage, ACCEPT_TOKEN, REJECT_TOKEN};
use termshare_utils::{Result, TermshareError};

use crate::commands::parse_command;
use crate::connection::Connection;

/// Capacity of the stdin line channel
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Which side of the session this console is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The default peer; starts as editor and answers control requests
    Host,
    /// Any other peer; starts as a viewer
    Guest,
}

/// Result of handling a server line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shown {
    /// Print this line
    Print(String),
    /// Print this line and leave
    Exit(String),
    /// Nothing to show
    Nothing,
}

/// Result of handling a typed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Send this line to the server
    Send(ClientMessage),
    /// Tell the user why nothing was sent
    Notice(String),
}

/// Editor-role bookkeeping for one console
#[derive(Debug, Clone)]
pub struct ConsoleState {
    role: Role,
    is_editor: bool,
}

impl ConsoleState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            is_editor: role == Role::Host,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_editor(&self) -> bool {
        self.is_editor
    }

    /// Apply a line received from the server
    pub fn on_server_message(&mut self, message: ServerMessage) -> Shown {
        match message {
            ServerMessage::Text(text) => Shown::Print(text),
            ServerMessage::Control(ControlVerb::GrantControl) => {
                self.is_editor = true;
                match self.role {
                    Role::Guest => Shown::Print("Your editor request has been accepted".into()),
                    Role::Host => Shown::Print("Editor control is back with you".into()),
                }
            }
            ServerMessage::Control(ControlVerb::DenyControl) => {
                Shown::Print("Your editor request has been rejected".into())
            }
            ServerMessage::Control(ControlVerb::ControlGivenBack) => {
                self.is_editor = false;
                Shown::Print("Editor control has been relinquished".into())
            }
            ServerMessage::Control(ControlVerb::QuitApproved) => {
                Shown::Exit("Session closed".into())
            }
            ServerMessage::Control(verb) => {
                debug!(verb = %verb, "Ignoring control line");
                Shown::Nothing
            }
            ServerMessage::Welcome { .. } => Shown::Nothing,
        }
    }

    /// Map a typed line to what should be sent
    pub fn on_input(&self, line: &str) -> InputAction {
        if let Some(command) = parse_command(line) {
            return InputAction::Send(ClientMessage::Control(command.verb()));
        }

        let trimmed = line.trim();
        let is_decision = trimmed == ACCEPT_TOKEN || trimmed == REJECT_TOKEN;
        if self.is_editor || (self.role == Role::Host && is_decision) {
            return InputAction::Send(ClientMessage::Data(line.to_string()));
        }

        InputAction::Notice(
            "You are not the editor. Type /request_control to ask for access.".into(),
        )
    }
}

/// Read stdin lines on a dedicated thread
///
/// The channel closes at EOF. A plain thread is used because a blocked stdin
/// read would otherwise hold up runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}

/// Run the console until the session ends
///
/// Server lines are written to `out`. When `input` closes, `quit` is sent and
/// the console keeps printing until the server approves it.
pub async fn run_console<S, W>(
    connection: Connection<S>,
    role: Role,
    mut input: mpsc::Receiver<String>,
    mut out: W,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: Write,
{
    let mut state = ConsoleState::new(role);
    let (mut sink, mut stream) = connection.into_framed().split();
    let mut input_open = true;

    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok(Ok(message))) => match state.on_server_message(message) {
                        Shown::Print(line) => writeln!(out, "{}", line)?,
                        Shown::Exit(line) => {
                            writeln!(out, "{}", line)?;
                            out.flush()?;
                            return Ok(());
                        }
                        Shown::Nothing => {}
                    },
                    Some(Ok(Err(e))) => warn!(error = %e, "Ignoring malformed line from server"),
                    Some(Err(e)) => return Err(TermshareError::protocol(e.to_string())),
                    None => {
                        writeln!(out, "Connection closed by server")?;
                        out.flush()?;
                        return Err(TermshareError::ConnectionClosed);
                    }
                }
                out.flush()?;
            }
            line = input.recv(), if input_open => {
                let message = match line {
                    Some(line) => match state.on_input(&line) {
                        InputAction::Send(message) => message,
                        InputAction::Notice(notice) => {
                            writeln!(out, "{}", notice)?;
                            out.flush()?;
                            continue;
                        }
                    },
                    None => {
                        input_open = false;
                        ClientMessage::Control(ControlVerb::Quit)
                    }
                };

                if matches!(message, ClientMessage::Control(ControlVerb::Quit)) {
                    debug!("Leaving session");
                }
                sink.send(message)
                    .await
                    .map_err(|e| TermshareError::Connection(e.to_string()))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    #[test]
    fn test_guest_starts_as_viewer() {
        let state = ConsoleState::new(Role::Guest);
        assert!(!state.is_editor());
        assert!(matches!(state.on_input("ls"), InputAction::Notice(_)));
    }

    #[test]
    fn test_host_starts_as_editor() {
        let state = ConsoleState::new(Role::Host);
        assert!(state.is_editor());
        assert_eq!(
            state.on_input("ls -la"),
            InputAction::Send(ClientMessage::Data("ls -la".into()))
        );
    }

    #[test]
    fn test_grant_and_give_back_toggle_editor() {
        let mut state = ConsoleState::new(Role::Guest);

        let shown = state.on_server_message(ServerMessage::Control(ControlVerb::GrantControl));
        assert_eq!(shown, Shown::Print("Your editor request has been accepted".into()));
        assert!(state.is_editor());

        state.on_server_message(ServerMessage::Control(ControlVerb::ControlGivenBack));
        assert!(!state.is_editor());
    }

    #[test]
    fn test_deny_keeps_viewer() {
        let mut state = ConsoleState::new(Role::Guest);
        let shown = state.on_server_message(ServerMessage::Control(ControlVerb::DenyControl));
        assert_eq!(shown, Shown::Print("Your editor request has been rejected".into()));
        assert!(!state.is_editor());
    }

    #[test]
    fn test_host_can_always_answer_requests() {
        let mut state = ConsoleState::new(Role::Host);
        state.on_server_message(ServerMessage::Control(ControlVerb::ControlGivenBack));
        assert!(!state.is_editor());

        assert_eq!(
            state.on_input("y"),
            InputAction::Send(ClientMessage::Data("y".into()))
        );
        assert!(matches!(state.on_input("ls"), InputAction::Notice(_)));
    }

    #[test]
    fn test_commands_always_sent() {
        let state = ConsoleState::new(Role::Guest);
        assert_eq!(
            state.on_input("/request_control"),
            InputAction::Send(ClientMessage::Control(ControlVerb::RequestControl))
        );
        assert!(matches!(state.on_input("/nope"), InputAction::Notice(_)));
    }

    #[test]
    fn test_editor_slash_paths_reach_shell() {
        let state = ConsoleState::new(Role::Host);
        assert_eq!(
            state.on_input("/bin/ls -la"),
            InputAction::Send(ClientMessage::Data("/bin/ls -la".into()))
        );
        assert_eq!(
            state.on_input("/usr/bin/env"),
            InputAction::Send(ClientMessage::Data("/usr/bin/env".into()))
        );
    }

    #[test]
    fn test_quit_approved_exits() {
        let mut state = ConsoleState::new(Role::Guest);
        assert!(matches!(
            state.on_server_message(ServerMessage::Control(ControlVerb::QuitApproved)),
            Shown::Exit(_)
        ));
    }

    async fn connected(server: DuplexStream) -> BufReader<DuplexStream> {
        let mut reader = BufReader::new(server);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        reader.get_mut().write_all(b"WELCOME s-1\n").await.unwrap();
        reader
    }

    #[tokio::test]
    async fn test_console_prints_and_exits_on_input_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut reader = connected(server).await;
            reader
                .get_mut()
                .write_all(b"[HOST] hello\n")
                .await
                .unwrap();

            // Console sends quit once its input closes
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "type=quit\n");
            reader
                .get_mut()
                .write_all(b"type=quit_approved\n")
                .await
                .unwrap();
        });

        let conn = Connection::handshake(client, "alice", Duration::from_secs(2))
            .await
            .unwrap();
        let (input_tx, input_rx) = mpsc::channel(4);
        let mut out = Vec::new();

        let run = run_console(conn, Role::Guest, input_rx, &mut out);
        let close_input = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(input_tx);
        };
        let (result, ()) = tokio::join!(run, close_input);

        result.unwrap();
        server.await.unwrap();
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("[HOST] hello"));
        assert!(printed.contains("Session closed"));
    }

    #[tokio::test]
    async fn test_console_reports_server_close() {
        let (client, server) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let reader = connected(server).await;
            drop(reader);
        });

        let conn = Connection::handshake(client, "bob", Duration::from_secs(2))
            .await
            .unwrap();
        server.await.unwrap();

        let (_input_tx, input_rx) = mpsc::channel(4);
        let mut out = Vec::new();
        let err = run_console(conn, Role::Guest, input_rx, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, TermshareError::ConnectionClosed));
    }
}
