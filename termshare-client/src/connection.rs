//! Connection to a termshare server
//!
//! Dials the server, performs the `HELLO` / `WELCOME` handshake and hands back
//! a framed line transport for the console.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info};
use url::Url;

use termshare_protocol::{ClientCodec, ClientMessage, ControlVerb, ServerMessage};
use termshare_utils::{Result, TermshareError};

/// How long to wait for the server's reply to `HELLO`
pub const WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalize a user-supplied address to `host:port`
///
/// Accepts `host:port` or `tcp://host:port`.
pub fn parse_address(input: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TermshareError::connection("empty server address"));
    }

    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TermshareError::Connection(format!("Invalid URL '{}': {}", input, e)))?;
        if url.scheme() != "tcp" {
            return Err(TermshareError::Connection(format!(
                "Unsupported scheme '{}', expected tcp://",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TermshareError::connection("Missing host in TCP URL"))?;
        let port = url
            .port()
            .ok_or_else(|| TermshareError::connection("Missing port in TCP URL"))?;
        return Ok(format!("{}:{}", host, port));
    }

    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(input.to_string())
        }
        _ => Err(TermshareError::Connection(format!(
            "Invalid address '{}', expected host:port",
            input
        ))),
    }
}

/// An established session with the server
pub struct Connection<S = TcpStream> {
    framed: Framed<S, ClientCodec>,
    username: String,
    session_id: String,
}

impl Connection<TcpStream> {
    /// Dial `addr` and join as `username`
    pub async fn connect(addr: &str, username: &str) -> Result<Self> {
        Self::connect_with_timeout(addr, username, WELCOME_TIMEOUT).await
    }

    /// Dial `addr` and join as `username`, waiting at most `ack_timeout`
    /// for the server to accept
    pub async fn connect_with_timeout(
        addr: &str,
        username: &str,
        ack_timeout: Duration,
    ) -> Result<Self> {
        let addr = parse_address(addr)?;
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            TermshareError::Connection(format!("Failed to connect to {}: {}", addr, e))
        })?;
        debug!("Connected to {}", addr);

        Self::handshake(stream, username, ack_timeout).await
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the handshake over an already open stream
    ///
    /// A taken username yields [`TermshareError::NameTaken`] so the caller
    /// can retry with another name.
    pub async fn handshake(stream: S, username: &str, ack_timeout: Duration) -> Result<Self> {
        let username = username.trim();
        if username.is_empty() {
            return Err(TermshareError::handshake("username must not be empty"));
        }

        let mut framed = Framed::new(stream, ClientCodec::new());
        framed
            .send(ClientMessage::Hello {
                username: username.to_string(),
            })
            .await
            .map_err(|e| TermshareError::Connection(e.to_string()))?;

        let reply = match tokio::time::timeout(ack_timeout, framed.next()).await {
            Err(_) => {
                return Err(TermshareError::ConnectionTimeout {
                    seconds: ack_timeout.as_secs(),
                })
            }
            Ok(None) => return Err(TermshareError::ConnectionClosed),
            Ok(Some(Err(e))) => return Err(TermshareError::protocol(e.to_string())),
            Ok(Some(Ok(Err(e)))) => return Err(TermshareError::handshake(e.to_string())),
            Ok(Some(Ok(Ok(reply)))) => reply,
        };

        match reply {
            ServerMessage::Welcome { session_id } => {
                info!(username, session_id = %session_id, "Joined session");
                Ok(Self {
                    framed,
                    username: username.to_string(),
                    session_id,
                })
            }
            ServerMessage::Control(ControlVerb::ClientNameTaken) => {
                Err(TermshareError::NameTaken(username.to_string()))
            }
            other => Err(TermshareError::handshake(format!(
                "unexpected reply to HELLO: {}",
                other
            ))),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Give up the handshake metadata and keep the transport
    pub fn into_framed(self) -> Framed<S, ClientCodec> {
        self.framed
    }
}
