//! Output fan-out
//!
//! Delivers lines to peers through their bounded outbound queues. Enqueueing
//! never blocks: when a peer's queue is full the line is dropped for that peer
//! only, so one slow reader cannot stall the session.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tracing::{debug, trace, warn};

use termshare_protocol::{ServerCodec, ServerMessage};

use crate::registry::{ClientRegistry, ControlState, Peer};

/// Try to enqueue a message for one peer (non-blocking)
///
/// Returns `true` if the message was queued. A full queue drops the message;
/// a closed queue means the peer's drain task has ended and its deregistration
/// is already under way.
pub(crate) fn try_deliver(
    username: &str,
    sender: &mpsc::Sender<ServerMessage>,
    message: ServerMessage,
) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(peer = %username, "Outbound queue full, message dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!(peer = %username, "Outbound queue closed, message skipped");
            false
        }
    }
}

/// Prefix a line with the name of the current editor
pub fn format_broadcast(editor: &str, text: &str) -> String {
    format!("[{}] {}", editor, text)
}

impl ControlState {
    /// Send a message to a single peer
    pub(crate) fn send_to(&self, username: &str, message: ServerMessage) -> bool {
        match self.peers.get(username) {
            Some(entry) => try_deliver(username, &entry.sender, message),
            None => false,
        }
    }

    /// Broadcast `[<editor>] <text>` to every peer except `exclude`
    ///
    /// Returns the number of peers the line was queued for.
    pub(crate) fn broadcast(&self, text: &str, exclude: Option<&str>) -> usize {
        let line = format_broadcast(&self.editor, text);
        let mut delivered = 0;
        for (name, entry) in &self.peers {
            if Some(name.as_str()) == exclude {
                continue;
            }
            if try_deliver(name, &entry.sender, ServerMessage::Text(line.clone())) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Fan shell output out to every peer, unprefixed
    pub(crate) fn fan_out(&self, text: &str) -> usize {
        let mut delivered = 0;
        for (name, entry) in &self.peers {
            if try_deliver(name, &entry.sender, ServerMessage::Text(text.to_string())) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl ClientRegistry {
    /// Send a message to a specific peer (non-blocking)
    pub fn send_to(&self, username: &str, message: ServerMessage) -> bool {
        self.lock().send_to(username, message)
    }

    /// Broadcast a line prefixed with the current editor's name
    ///
    /// The editor name and the set of recipients are read under the same
    /// lock, so the prefix always matches the editor at enqueue time.
    pub fn broadcast(&self, text: &str, exclude: Option<&str>) -> usize {
        self.lock().broadcast(text, exclude)
    }

    /// Fan a chunk of shell output out to every peer
    ///
    /// The chunk is sent as one line; the codec appends the terminator.
    pub fn fan_out_shell_output(&self, chunk: &[u8]) -> usize {
        let text = String::from_utf8_lossy(chunk);
        let delivered = self.lock().fan_out(&text);
        trace!(bytes = chunk.len(), delivered, "Shell output fanned out");
        delivered
    }
}

/// Outbound drain task body
///
/// Writes queued lines to the peer's connection in order until the queue is
/// closed or a write fails. Lines queued before the close are still written.
/// The caller deregisters the peer once this returns.
pub async fn drain_outbound<W>(
    peer: &Peer,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut sink: FramedWrite<W, ServerCodec>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(peer = %peer, error = %e, "Failed to write to peer");
            return;
        }
    }

    debug!(peer = %peer, "Outbound queue closed");
    if let Err(e) = sink.close().await {
        debug!(peer = %peer, error = %e, "Error closing peer connection");
    }
}
