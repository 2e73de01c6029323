//! Editor control handoff
//!
//! Exactly one peer may type into the shell at a time: the host (default
//! peer) or one guest. Guests ask with `request_control`, the host answers
//! `y`/`n`, and the editor hands control back with `give_back_control`.
//!
//! Every transition runs under the registry lock. A pending request is a
//! per-request rendezvous identified by a UUID, so a late or duplicate answer
//! can never resolve a different request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use termshare_protocol::{ControlVerb, ServerMessage};

use crate::registry::{ClientRegistry, Peer, PendingRequest};

/// Prefix of the notice broadcast when the editor changes
pub const CONTROL_CHANGE_PREFIX: &str = "Editor access has been granted to: ";

/// Human-readable notice announcing a new editor
pub fn control_change_notice(editor: &str) -> String {
    format!("{}{}", CONTROL_CHANGE_PREFIX, editor)
}

/// Prompt shown to the host when a guest asks for control
pub fn control_request_prompt(requester: &str) -> String {
    format!(
        "User {} is requesting editor access. Enter 'y' to grant or 'n' to deny.",
        requester
    )
}

/// Why a control request was denied without asking the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A guest already holds the editor role
    EditorBusy,
    /// Another request is waiting on the host
    RequestPending,
    /// The host is the editor already
    AlreadyEditor,
    /// The requester is no longer registered
    NotRegistered,
}

/// A request waiting on the host's answer
#[derive(Debug)]
pub struct PendingDecision {
    pub id: Uuid,
    rx: oneshot::Receiver<bool>,
}

/// Outcome of `request_control`
#[derive(Debug)]
pub enum RequestOutcome {
    /// `deny_control` was sent to the requester
    Denied(DenyReason),
    /// The host was asked; resolve with [`await_decision`]
    Pending(PendingDecision),
}

/// Final outcome of a request once the host's answer is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    Denied,
}

/// Outcome of `give_back_control`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveBackOutcome {
    /// Control went back to the host
    Returned,
    /// The sender was not the editor and relinquishing is restricted
    Rejected,
}

impl ClientRegistry {
    /// Start a control request from `requester`
    ///
    /// Allowed only while the host is the editor and no other request is
    /// pending. Otherwise `deny_control` is sent immediately and the host is
    /// not contacted.
    pub fn request_control(&self, requester: &Peer) -> RequestOutcome {
        let mut state = self.lock();

        let reason = if !state.is_current(requester) {
            Some(DenyReason::NotRegistered)
        } else if self.is_default(&requester.username) {
            Some(DenyReason::AlreadyEditor)
        } else if state.editor != self.default_peer() {
            Some(DenyReason::EditorBusy)
        } else if state.pending.is_some() {
            Some(DenyReason::RequestPending)
        } else {
            None
        };

        if let Some(reason) = reason {
            debug!(peer = %requester, ?reason, "Control request denied");
            state.send_to(
                &requester.username,
                ServerMessage::Control(ControlVerb::DenyControl),
            );
            return RequestOutcome::Denied(reason);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        state.pending = Some(PendingRequest {
            id,
            requester: requester.clone(),
            decision_tx: Some(tx),
        });

        info!(peer = %requester, request_id = %id, "User is requesting editor access");
        state.send_to(
            self.default_peer(),
            ServerMessage::Text(control_request_prompt(&requester.username)),
        );

        RequestOutcome::Pending(PendingDecision { id, rx })
    }

    /// Whether a control request is waiting on the host
    pub fn has_pending_request(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Deliver the host's answer to the pending request
    ///
    /// Returns `false` when no request is pending, in which case the host's
    /// line is ordinary input. A repeated answer to an already-answered
    /// request is swallowed.
    pub fn submit_decision(&self, accept: bool) -> bool {
        let mut state = self.lock();
        let Some(pending) = state.pending.as_mut() else {
            return false;
        };

        match pending.decision_tx.take() {
            Some(tx) => {
                info!(
                    peer = %pending.requester,
                    request_id = %pending.id,
                    accept,
                    "Host answered control request"
                );
                // The awaiting task may already be gone (timeout); nothing to do then
                let _ = tx.send(accept);
            }
            None => debug!(request_id = %pending.id, "Control request already answered"),
        }
        true
    }

    /// Apply the outcome of request `id`
    ///
    /// `decision` is `None` when the rendezvous was abandoned (timeout,
    /// requester left, shutdown). The grant is applied only if `id` is still
    /// the pending request, the host is still the editor and the requester is
    /// still registered.
    pub fn complete_request(
        &self,
        requester: &Peer,
        id: Uuid,
        decision: Option<bool>,
    ) -> GrantOutcome {
        let mut state = self.lock();

        let was_pending = state.pending.as_ref().map(|p| p.id == id).unwrap_or(false);
        if was_pending {
            state.pending = None;
        }

        let grantable = was_pending
            && decision == Some(true)
            && state.editor == self.default_peer()
            && !self.is_default(&requester.username)
            && state.is_current(requester);

        if !grantable {
            debug!(peer = %requester, request_id = %id, ?decision, "Control request denied");
            state.send_to(
                &requester.username,
                ServerMessage::Control(ControlVerb::DenyControl),
            );
            return GrantOutcome::Denied;
        }

        let previous = std::mem::replace(&mut state.editor, requester.username.clone());
        state.send_to(&previous, ServerMessage::Control(ControlVerb::ControlGivenBack));
        state.send_to(
            &requester.username,
            ServerMessage::Control(ControlVerb::GrantControl),
        );
        state.broadcast(
            &control_change_notice(&requester.username),
            Some(&requester.username),
        );

        info!(peer = %requester, previous = %previous, "Editor access granted");
        GrantOutcome::Granted
    }

    /// Hand the editor role back to the host
    ///
    /// Unless `restrict` is set, any peer may send this. With `restrict`, a
    /// sender that is not the current editor receives `deny_control` instead.
    pub fn give_back_control(&self, sender: &Peer, restrict: bool) -> GiveBackOutcome {
        let mut state = self.lock();

        if restrict && state.editor != sender.username {
            warn!(peer = %sender, editor = %state.editor, "Relinquish from non-editor rejected");
            state.send_to(&sender.username, ServerMessage::Control(ControlVerb::DenyControl));
            return GiveBackOutcome::Rejected;
        }

        let default_peer = self.default_peer().to_string();
        let previous = std::mem::replace(&mut state.editor, default_peer.clone());

        state.send_to(&sender.username, ServerMessage::Control(ControlVerb::ControlGivenBack));
        state.send_to(&default_peer, ServerMessage::Control(ControlVerb::GrantControl));
        state.broadcast(&control_change_notice(&default_peer), Some(&default_peer));

        info!(peer = %sender, previous = %previous, "Editor control given back to host");
        GiveBackOutcome::Returned
    }

    /// Broadcast the notice for the current editor
    pub fn announce_editor(&self) -> usize {
        let state = self.lock();
        let editor = state.editor.clone();
        state.broadcast(&control_change_notice(&editor), Some(&editor))
    }
}

/// Wait for the host's answer and apply it
///
/// Without a timeout the request waits until the host answers. With one, an
/// unanswered request is denied when it elapses.
pub async fn await_decision(
    registry: Arc<ClientRegistry>,
    requester: Peer,
    pending: PendingDecision,
    timeout: Option<Duration>,
) -> GrantOutcome {
    let PendingDecision { id, rx } = pending;

    let decision = match timeout {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(answer) => answer.ok(),
            Err(_) => {
                info!(peer = %requester, request_id = %id, "Control request timed out");
                None
            }
        },
        None => rx.await.ok(),
    };

    registry.complete_request(&requester, id, decision)
}
