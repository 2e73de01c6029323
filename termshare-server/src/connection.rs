//! Per-connection handling
//!
//! A connection is handshaken, registered, and then split into two tasks: an
//! outbound drain writing the peer's queue to the socket, and the inbound loop
//! routing each decoded line. Whichever side ends first deregisters the peer.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use termshare_protocol::{ClientMessage, ControlVerb, ServerCodec, ServerMessage};
use termshare_utils::{Result, TermshareError};

use crate::fanout::drain_outbound;
use crate::registry::{Registration, RegistryError};
use crate::session::{Flow, SharedState};

/// Wait for the `HELLO <username>` line
///
/// Any failure (timeout, EOF, malformed line, transport error) aborts the
/// connection before any state is touched.
pub async fn handshake<R>(
    inbound: &mut FramedRead<R, ServerCodec>,
    timeout: Duration,
) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, inbound.next()).await {
        Err(_) => Err(TermshareError::ConnectionTimeout {
            seconds: timeout.as_secs(),
        }),
        Ok(None) => Err(TermshareError::ConnectionClosed),
        Ok(Some(Err(e))) => Err(TermshareError::protocol(e.to_string())),
        Ok(Some(Ok(Err(e)))) => Err(TermshareError::handshake(e.to_string())),
        Ok(Some(Ok(Ok(ClientMessage::Hello { username })))) => Ok(username),
        Ok(Some(Ok(Ok(other)))) => Err(TermshareError::handshake(format!(
            "expected HELLO, got {:?}",
            other
        ))),
    }
}

/// Serve one peer connection until it ends
pub async fn handle_client<R, W>(reader: R, writer: W, state: SharedState)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let max_length = state.config.max_line_length;
    let mut inbound = FramedRead::new(reader, ServerCodec::with_max_length(max_length));
    let mut outbound = FramedWrite::new(writer, ServerCodec::with_max_length(max_length));

    let username = match handshake(&mut inbound, state.config.handshake_timeout()).await {
        Ok(username) => username,
        Err(e) => {
            debug!(error = %e, "Handshake failed, closing connection");
            return;
        }
    };

    let Registration {
        peer,
        outbound: queue,
        cancel,
    } = match state.registry.register(&username) {
        Ok(registration) => registration,
        Err(RegistryError::NameTaken(name)) => {
            info!(peer = %name, "Username taken, rejecting connection");
            let _ = outbound
                .send(ServerMessage::Control(ControlVerb::ClientNameTaken))
                .await;
            return;
        }
        Err(RegistryError::Closed) => {
            debug!(peer = %username, "Session shutting down, rejecting connection");
            let _ = outbound
                .send(ServerMessage::Control(ControlVerb::QuitApproved))
                .await;
            return;
        }
    };

    let welcome = ServerMessage::Welcome {
        session_id: peer.session_id.clone(),
    };
    if let Err(e) = outbound.send(welcome).await {
        warn!(peer = %peer, error = %e, "Failed to send WELCOME");
        state.depart(&peer);
        return;
    }

    {
        let state = state.clone();
        let peer = peer.clone();
        state.tasks.clone().spawn(async move {
            drain_outbound(&peer, queue, outbound).await;
            state.depart(&peer);
        });
    }

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, "Inbound routing cancelled");
                break;
            }
            item = inbound.next() => item,
        };

        match item {
            Some(Ok(Ok(message))) => {
                if state.route_message(&peer, message) == Flow::Disconnect {
                    break;
                }
            }
            Some(Ok(Err(e))) => {
                warn!(peer = %peer, error = %e, "Ignoring malformed line");
            }
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Read error");
                break;
            }
            None => {
                debug!(peer = %peer, "Peer closed connection");
                break;
            }
        }
    }

    state.depart(&peer);
}
