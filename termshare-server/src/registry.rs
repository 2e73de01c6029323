//! Client Connection Registry
//!
//! Tracks connected peers together with the session's control state: who is
//! the current editor and whether a control request is waiting on the host.
//! Membership and control fields live behind one lock so that no two control
//! transitions can interleave.

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use termshare_protocol::{ControlVerb, ServerMessage};

use crate::control::control_change_notice;
use crate::fanout::try_deliver;

/// Default capacity of a peer's outbound queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default identity of the host's own loopback connection
pub const DEFAULT_PEER_NAME: &str = "HOST";

/// Identity of a registered peer
///
/// The session id tells a departed peer apart from a later peer that
/// registered under the same username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub username: String,
    pub session_id: String,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.username)
    }
}

/// Registry entry for a connected peer
pub(crate) struct PeerEntry {
    pub(crate) session_id: String,
    /// Producer side of the peer's bounded outbound queue
    pub(crate) sender: mpsc::Sender<ServerMessage>,
    /// Cancels the peer's inbound routing task
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry")
            .field("session_id", &self.session_id)
            .field("sender_closed", &self.sender.is_closed())
            .finish()
    }
}

/// Everything a connection needs after a successful registration
#[derive(Debug)]
pub struct Registration {
    pub peer: Peer,
    /// Consumer side of the outbound queue, drained by exactly one task
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub cancel: CancellationToken,
}

/// Registry error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("username already registered: {0}")]
    NameTaken(String),

    #[error("session is shutting down")]
    Closed,
}

/// Result of removing a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The peer was not (or no longer) registered
    NotRegistered,
    /// The peer was removed
    Removed {
        /// The peer held the editor role, which went back to the host
        editor_reverted: bool,
    },
}

/// A control request waiting on the host's decision
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) id: Uuid,
    pub(crate) requester: Peer,
    /// Taken when the host answers; the request stays pending until the
    /// awaiting task resolves it
    pub(crate) decision_tx: Option<oneshot::Sender<bool>>,
}

/// State guarded by the registry lock
#[derive(Debug)]
pub(crate) struct ControlState {
    pub(crate) peers: HashMap<String, PeerEntry>,
    pub(crate) editor: String,
    pub(crate) pending: Option<PendingRequest>,
    /// Set by `close_all`; no peer registers afterwards
    pub(crate) closed: bool,
}

impl ControlState {
    /// Whether `peer` is registered under its own session (not a newer one)
    pub(crate) fn is_current(&self, peer: &Peer) -> bool {
        self.peers
            .get(&peer.username)
            .map(|entry| entry.session_id == peer.session_id)
            .unwrap_or(false)
    }
}

/// Registry tracking all connected peers and the single control state
pub struct ClientRegistry {
    default_peer: String,
    queue_capacity: usize,
    state: Mutex<ControlState>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_NAME, DEFAULT_QUEUE_CAPACITY)
    }
}

impl ClientRegistry {
    /// Create an empty registry whose initial editor is `default_peer`
    pub fn new(default_peer: impl Into<String>, queue_capacity: usize) -> Self {
        let default_peer = default_peer.into();
        Self {
            state: Mutex::new(ControlState {
                peers: HashMap::new(),
                editor: default_peer.clone(),
                pending: None,
                closed: false,
            }),
            default_peer,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock()
    }

    // ==================== Peer Management ====================

    /// Register a new peer
    ///
    /// The membership check and the insert happen under one lock, so two
    /// concurrent handshakes for the same name cannot both succeed. Fails
    /// with [`RegistryError::Closed`] once the registry has been closed.
    pub fn register(&self, username: &str) -> Result<Registration, RegistryError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RegistryError::Closed);
        }
        if state.peers.contains_key(username) {
            return Err(RegistryError::NameTaken(username.to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let (sender, outbound) = mpsc::channel(self.queue_capacity);
        let cancel = CancellationToken::new();

        state.peers.insert(
            username.to_string(),
            PeerEntry {
                session_id: session_id.clone(),
                sender,
                cancel: cancel.clone(),
            },
        );
        info!(peer = %username, session_id = %session_id, "New peer registered");

        Ok(Registration {
            peer: Peer {
                username: username.to_string(),
                session_id,
            },
            outbound,
            cancel,
        })
    }

    /// Remove a peer
    ///
    /// Idempotent: removing an absent peer, or a peer whose name now belongs
    /// to a newer session, is a no-op. Dropping the entry closes the outbound
    /// queue exactly once; queued lines are still flushed by the drain task.
    pub fn deregister(&self, peer: &Peer) -> Departure {
        let mut state = self.lock();
        if !state.is_current(peer) {
            return Departure::NotRegistered;
        }

        if let Some(entry) = state.peers.remove(&peer.username) {
            entry.cancel.cancel();
        }

        if state
            .pending
            .as_ref()
            .map(|p| p.requester == *peer)
            .unwrap_or(false)
        {
            debug!(peer = %peer, "Pending control request cancelled by departure");
            state.pending = None;
        }

        let editor_reverted = state.editor == peer.username && peer.username != self.default_peer;
        if editor_reverted {
            state.editor = self.default_peer.clone();
            state.send_to(&self.default_peer, ServerMessage::Control(ControlVerb::GrantControl));
            let notice = control_change_notice(&self.default_peer);
            state.broadcast(&notice, Some(&self.default_peer));
            info!(peer = %peer, "Editor left, control returned to {}", self.default_peer);
        }

        info!(peer = %peer, "Peer removed");
        Departure::Removed { editor_reverted }
    }

    /// Remove every peer, telling each one its departure is approved
    ///
    /// Used on shutdown. The registry stays closed, so later registrations
    /// fail. Returns the number of peers removed.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.pending = None;
        state.editor = self.default_peer.clone();

        let peers: Vec<(String, PeerEntry)> = state.peers.drain().collect();
        for (name, entry) in &peers {
            try_deliver(name, &entry.sender, ServerMessage::Control(ControlVerb::QuitApproved));
            entry.cancel.cancel();
        }
        peers.len()
    }

    // ==================== Queries ====================

    /// Identity reserved for the host's loopback connection
    pub fn default_peer(&self) -> &str {
        &self.default_peer
    }

    pub fn is_default(&self, username: &str) -> bool {
        username == self.default_peer
    }

    /// Username of the peer currently allowed to type into the shell
    pub fn current_editor(&self) -> String {
        self.lock().editor.clone()
    }

    pub fn is_registered(&self, username: &str) -> bool {
        self.lock().peers.contains_key(username)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Registered usernames, sorted
    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().peers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ClientRegistry")
            .field("default_peer", &self.default_peer)
            .field("editor", &state.editor)
            .field("peer_count", &state.peers.len())
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(DEFAULT_PEER_NAME, 10)
    }

    #[test]
    fn test_registry_new() {
        let registry = registry();
        assert_eq!(registry.peer_count(), 0);
        assert_eq!(registry.current_editor(), DEFAULT_PEER_NAME);
        assert_eq!(registry.default_peer(), DEFAULT_PEER_NAME);
    }

    #[test]
    fn test_registry_default() {
        let registry = ClientRegistry::default();
        assert_eq!(registry.queue_capacity(), DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_register_issues_unique_session_ids() {
        let registry = registry();
        let a = registry.register("alice").unwrap();
        let b = registry.register("bob").unwrap();

        assert_ne!(a.peer.session_id, b.peer.session_id);
        assert_eq!(registry.peer_names(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_register_duplicate_name_rejected() {
        let registry = registry();
        let _bob = registry.register("bob").unwrap();

        let err = registry.register("bob").unwrap_err();
        assert_eq!(err, RegistryError::NameTaken("bob".into()));
        assert_eq!(registry.peer_count(), 1);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let registry = registry();
        let reg = registry.register("alice").unwrap();

        assert_eq!(
            registry.deregister(&reg.peer),
            Departure::Removed { editor_reverted: false }
        );
        assert_eq!(registry.deregister(&reg.peer), Departure::NotRegistered);
        assert!(!registry.is_registered("alice"));
    }

    #[test]
    fn test_deregister_closes_queue_and_cancels() {
        let registry = registry();
        let mut reg = registry.register("alice").unwrap();

        registry.deregister(&reg.peer);

        assert!(reg.cancel.is_cancelled());
        assert!(matches!(
            reg.outbound.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_deregister_stale_session_keeps_new_peer() {
        let registry = registry();
        let old = registry.register("alice").unwrap();
        registry.deregister(&old.peer);
        let new = registry.register("alice").unwrap();

        assert_eq!(registry.deregister(&old.peer), Departure::NotRegistered);
        assert!(registry.is_registered("alice"));
        assert!(!new.cancel.is_cancelled());
    }

    #[test]
    fn test_deregister_other_peer_leaves_entries_intact() {
        let registry = registry();
        let alice = registry.register("alice").unwrap();
        let _bob = registry.register("bob").unwrap();

        registry.deregister(&alice.peer);

        assert_eq!(registry.peer_names(), vec!["bob"]);
        assert_eq!(registry.current_editor(), DEFAULT_PEER_NAME);
    }

    #[test]
    fn test_editor_departure_returns_control_to_host() {
        let registry = registry();
        let mut host = registry.register(DEFAULT_PEER_NAME).unwrap();
        let alice = registry.register("alice").unwrap();
        registry.lock().editor = "alice".into();

        let departure = registry.deregister(&alice.peer);

        assert_eq!(departure, Departure::Removed { editor_reverted: true });
        assert_eq!(registry.current_editor(), DEFAULT_PEER_NAME);
        assert_eq!(
            host.outbound.try_recv().unwrap(),
            ServerMessage::Control(ControlVerb::GrantControl)
        );
    }

    #[test]
    fn test_close_all_sends_quit_approved() {
        let registry = registry();
        let mut alice = registry.register("alice").unwrap();
        let mut bob = registry.register("bob").unwrap();

        assert_eq!(registry.close_all(), 2);

        for reg in [&mut alice, &mut bob] {
            assert_eq!(
                reg.outbound.try_recv().unwrap(),
                ServerMessage::Control(ControlVerb::QuitApproved)
            );
            assert!(reg.cancel.is_cancelled());
        }
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_register_after_close_all_fails() {
        let registry = registry();
        registry.close_all();

        assert_eq!(registry.register("late").unwrap_err(), RegistryError::Closed);
        assert_eq!(registry.peer_count(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let registry = ClientRegistry::new("HOST", 0);
        assert_eq!(registry.queue_capacity(), 1);
    }
}
