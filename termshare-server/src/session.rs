//! Session orchestration
//!
//! Routes each inbound line of a registered peer to the control handoff, the
//! host's decision rendezvous, or the shell plus fan-out. Also owns the
//! shell-output task and the orderly shutdown of the whole session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use termshare_protocol::{ClientMessage, ControlVerb, ServerMessage};

use crate::config::ServerConfig;
use crate::control::{await_decision, GiveBackOutcome, GrantOutcome, RequestOutcome};
use crate::registry::{ClientRegistry, Departure, Peer};
use crate::shell::{ShellBackend, ShellEvent};

/// What the connection should do after a line was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// State shared by every connection task
#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<ClientRegistry>,
    pub shell: Arc<dyn ShellBackend>,
    pub config: Arc<ServerConfig>,
    /// Cancelled once the session is shutting down
    shutdown: CancellationToken,
    /// Connection, drain and decision tasks
    pub tasks: TaskTracker,
}

impl SharedState {
    pub fn new(config: ServerConfig, shell: Arc<dyn ShellBackend>) -> Self {
        let registry = Arc::new(ClientRegistry::new(
            config.host_name.clone(),
            config.outbound_queue_capacity,
        ));
        Self {
            registry,
            shell,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Token cancelled when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut the whole session down
    ///
    /// Every peer is sent `quit_approved` and removed, the shell is closed and
    /// the accept loop stops. Safe to call more than once.
    pub fn shutdown(&self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(reason, "Shutting down session");
        self.shutdown.cancel();

        let removed = self.registry.close_all();
        debug!(removed, "Peers closed");

        if let Err(e) = self.shell.close() {
            warn!(error = %e, "Failed to close shell");
        }
    }

    /// Write a line to the shell, logging failures
    pub fn feed_shell(&self, line: &str) {
        if let Err(e) = self.shell.write_line(line) {
            warn!(error = %e, "Failed to write to shell");
        }
    }

    /// Remove a peer after its connection ended
    ///
    /// Losing the host's own connection ends the session.
    pub fn depart(&self, peer: &Peer) {
        match self.registry.deregister(peer) {
            Departure::Removed { editor_reverted } => {
                if editor_reverted {
                    self.feed_shell("");
                }
                if self.registry.is_default(&peer.username) {
                    self.shutdown("host disconnected");
                }
            }
            Departure::NotRegistered => {}
        }
    }

    /// Route one decoded line from `peer`
    pub fn route_message(&self, peer: &Peer, message: ClientMessage) -> Flow {
        if self.registry.is_default(&peer.username) {
            if let Some(accept) = message.as_decision() {
                if self.registry.submit_decision(accept) {
                    return Flow::Continue;
                }
            }
        }

        match message {
            ClientMessage::Control(verb) => self.route_control(peer, verb),
            ClientMessage::Data(text) => {
                self.route_data(peer, &text);
                Flow::Continue
            }
            ClientMessage::Hello { .. } => {
                debug!(peer = %peer, "Ignoring repeated handshake");
                Flow::Continue
            }
        }
    }

    fn route_data(&self, peer: &Peer, text: &str) {
        if self.config.enforce_editor_input && self.registry.current_editor() != peer.username {
            debug!(peer = %peer, "Dropping input from non-editor");
            return;
        }
        self.registry.broadcast(text, Some(&peer.username));
        self.feed_shell(text);
    }

    fn route_control(&self, peer: &Peer, verb: ControlVerb) -> Flow {
        match verb {
            ControlVerb::RequestControl => {
                if let RequestOutcome::Pending(pending) = self.registry.request_control(peer) {
                    let state = self.clone();
                    let requester = peer.clone();
                    let timeout = self.config.decision_timeout();
                    self.tasks.spawn(async move {
                        let outcome =
                            await_decision(state.registry.clone(), requester, pending, timeout)
                                .await;
                        if outcome == GrantOutcome::Granted {
                            state.feed_shell("");
                        }
                    });
                }
                Flow::Continue
            }
            ControlVerb::GiveBackControl => {
                let restrict = self.config.restrict_give_back;
                if self.registry.give_back_control(peer, restrict) == GiveBackOutcome::Returned {
                    self.feed_shell("");
                }
                Flow::Continue
            }
            ControlVerb::Quit => {
                if self.registry.is_default(&peer.username) {
                    info!(peer = %peer, "Host quit");
                    self.shutdown("host quit");
                    return Flow::Disconnect;
                }

                self.registry
                    .send_to(&peer.username, ServerMessage::Control(ControlVerb::QuitApproved));
                match self.registry.deregister(peer) {
                    Departure::Removed { editor_reverted: true } => self.feed_shell(""),
                    Departure::Removed { editor_reverted: false } => {
                        self.registry.announce_editor();
                    }
                    Departure::NotRegistered => {}
                }
                info!(peer = %peer, "Peer quit");
                Flow::Disconnect
            }
            other => {
                warn!(peer = %peer, verb = %other, "Unexpected control verb from peer");
                Flow::Continue
            }
        }
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("registry", &self.registry)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Fan shell output out to every peer until the shell goes away
///
/// Shell exit or a read error ends the session.
pub async fn run_shell_output(state: SharedState, mut events: mpsc::Receiver<ShellEvent>) {
    let shutdown = state.shutdown_token();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.cancelled() => break,
        };

        match event {
            Some(ShellEvent::Output(chunk)) => {
                state.registry.fan_out_shell_output(&chunk);
            }
            Some(ShellEvent::Exited) | None => {
                info!("Shell exited");
                state.shutdown("shell exited");
                break;
            }
            Some(ShellEvent::Error(e)) => {
                error!(error = %e, "Shell read failed");
                state.shutdown("shell read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use crate::shell::testing::RecordingShell;

    fn state_with(config: ServerConfig) -> (SharedState, Arc<RecordingShell>) {
        let shell = Arc::new(RecordingShell::default());
        (SharedState::new(config, shell.clone()), shell)
    }

    fn setup(names: &[&str]) -> (SharedState, Arc<RecordingShell>, Vec<Registration>) {
        let (state, shell) = state_with(ServerConfig::default());
        let regs = names
            .iter()
            .map(|n| state.registry.register(n).unwrap())
            .collect();
        (state, shell, regs)
    }

    fn drain(reg: &mut Registration) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = reg.outbound.try_recv() {
            out.push(msg);
        }
        out
    }

    fn data(text: &str) -> ClientMessage {
        ClientMessage::Data(text.into())
    }

    fn control(verb: ControlVerb) -> ClientMessage {
        ClientMessage::Control(verb)
    }

    #[test]
    fn test_editor_input_broadcast_and_fed_to_shell() {
        let (state, shell, mut regs) = setup(&["HOST", "alice", "bob"]);
        let host = regs[0].peer.clone();

        assert_eq!(state.route_message(&host, data("hello world")), Flow::Continue);

        assert_eq!(shell.lines(), vec!["hello world"]);
        assert!(drain(&mut regs[0]).is_empty());
        for reg in &mut regs[1..] {
            assert_eq!(
                drain(reg),
                vec![ServerMessage::Text("[HOST] hello world".into())]
            );
        }
    }

    #[test]
    fn test_non_editor_input_forwarded_by_default() {
        let (state, shell, mut regs) = setup(&["HOST", "alice"]);
        let alice = regs[1].peer.clone();

        state.route_message(&alice, data("whoami"));

        assert_eq!(shell.lines(), vec!["whoami"]);
        assert_eq!(drain(&mut regs[0]), vec![ServerMessage::Text("[HOST] whoami".into())]);
    }

    #[test]
    fn test_non_editor_input_dropped_when_enforced() {
        let config = ServerConfig {
            enforce_editor_input: true,
            ..Default::default()
        };
        let (state, shell) = state_with(config);
        let mut host = state.registry.register("HOST").unwrap();
        let alice = state.registry.register("alice").unwrap();

        state.route_message(&alice.peer, data("rm -rf /tmp/x"));

        assert!(shell.lines().is_empty());
        assert!(drain(&mut host).is_empty());
    }

    #[test]
    fn test_host_y_without_pending_request_is_data() {
        let (state, shell, regs) = setup(&["HOST"]);
        let host = regs[0].peer.clone();

        state.route_message(&host, data("y"));
        assert_eq!(shell.lines(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_guest_y_is_never_a_decision() {
        let (state, shell, regs) = setup(&["HOST", "alice", "bob"]);
        let alice = regs[1].peer.clone();
        let bob = regs[2].peer.clone();

        state.route_message(&alice, control(ControlVerb::RequestControl));
        state.route_message(&bob, data("y"));

        assert!(state.registry.has_pending_request());
        assert_eq!(shell.lines(), vec!["y"]);
    }

    #[tokio::test]
    async fn test_request_accept_grants_and_refreshes_prompt() {
        let (state, shell, mut regs) = setup(&["HOST", "alice", "bob"]);
        let host = regs[0].peer.clone();
        let alice = regs[1].peer.clone();

        state.route_message(&alice, control(ControlVerb::RequestControl));
        assert_eq!(drain(&mut regs[0]).len(), 1);

        // The host's answer is consumed, not fed to the shell
        state.route_message(&host, data("y"));

        state.tasks.close();
        state.tasks.wait().await;

        assert_eq!(state.registry.current_editor(), "alice");
        assert_eq!(shell.lines(), vec![""]);
        assert_eq!(
            drain(&mut regs[1]),
            vec![ServerMessage::Control(ControlVerb::GrantControl)]
        );
        let bob_msgs = drain(&mut regs[2]);
        assert_eq!(
            bob_msgs,
            vec![ServerMessage::Text(
                "[alice] Editor access has been granted to: alice".into()
            )]
        );
    }

    #[tokio::test]
    async fn test_request_reject_leaves_host_editor() {
        let (state, shell, mut regs) = setup(&["HOST", "alice"]);
        let host = regs[0].peer.clone();
        let alice = regs[1].peer.clone();

        state.route_message(&alice, control(ControlVerb::RequestControl));
        state.route_message(&host, data("n"));

        state.tasks.close();
        state.tasks.wait().await;

        assert_eq!(state.registry.current_editor(), "HOST");
        assert!(shell.lines().is_empty());
        assert_eq!(
            drain(&mut regs[1]),
            vec![ServerMessage::Control(ControlVerb::DenyControl)]
        );
    }

    #[test]
    fn test_give_back_feeds_empty_line() {
        let (state, shell, regs) = setup(&["HOST", "alice"]);
        state.registry.lock().editor = "alice".into();

        state.route_message(&regs[1].peer, control(ControlVerb::GiveBackControl));

        assert_eq!(state.registry.current_editor(), "HOST");
        assert_eq!(shell.lines(), vec![""]);
    }

    #[test]
    fn test_guest_quit_removes_only_that_peer() {
        let (state, shell, mut regs) = setup(&["HOST", "alice", "bob"]);
        let alice = regs[1].peer.clone();

        let flow = state.route_message(&alice, control(ControlVerb::Quit));

        assert_eq!(flow, Flow::Disconnect);
        assert_eq!(state.registry.peer_names(), vec!["HOST", "bob"]);
        assert!(!state.is_shutting_down());
        assert!(!shell.is_closed());

        assert_eq!(
            drain(&mut regs[1]),
            vec![ServerMessage::Control(ControlVerb::QuitApproved)]
        );
        assert_eq!(
            drain(&mut regs[2]),
            vec![ServerMessage::Text(
                "[HOST] Editor access has been granted to: HOST".into()
            )]
        );
    }

    #[test]
    fn test_editor_quit_reverts_control() {
        let (state, shell, mut regs) = setup(&["HOST", "alice"]);
        state.registry.lock().editor = "alice".into();

        state.route_message(&regs[1].peer, control(ControlVerb::Quit));

        assert_eq!(state.registry.current_editor(), "HOST");
        assert_eq!(shell.lines(), vec![""]);
        assert_eq!(
            drain(&mut regs[0]),
            vec![ServerMessage::Control(ControlVerb::GrantControl)]
        );
    }

    #[test]
    fn test_host_quit_shuts_everything_down() {
        let (state, shell, mut regs) = setup(&["HOST", "alice", "bob"]);
        let host = regs[0].peer.clone();

        let flow = state.route_message(&host, control(ControlVerb::Quit));

        assert_eq!(flow, Flow::Disconnect);
        assert!(state.is_shutting_down());
        assert!(shell.is_closed());
        assert_eq!(state.registry.peer_count(), 0);
        for reg in &mut regs {
            assert_eq!(
                drain(reg),
                vec![ServerMessage::Control(ControlVerb::QuitApproved)]
            );
            assert!(reg.cancel.is_cancelled());
        }
    }

    #[test]
    fn test_host_departure_shuts_down() {
        let (state, shell, regs) = setup(&["HOST", "alice"]);

        state.depart(&regs[0].peer);

        assert!(state.is_shutting_down());
        assert!(shell.is_closed());
    }

    #[test]
    fn test_guest_departure_keeps_session() {
        let (state, _shell, regs) = setup(&["HOST", "alice"]);

        state.depart(&regs[1].peer);
        state.depart(&regs[1].peer);

        assert!(!state.is_shutting_down());
        assert_eq!(state.registry.peer_names(), vec!["HOST"]);
    }

    #[test]
    fn test_unexpected_verb_ignored() {
        let (state, shell, regs) = setup(&["HOST", "alice"]);
        let flow = state.route_message(&regs[1].peer, control(ControlVerb::GrantControl));

        assert_eq!(flow, Flow::Continue);
        assert_eq!(state.registry.current_editor(), "HOST");
        assert!(shell.lines().is_empty());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (state, shell, _regs) = setup(&["HOST"]);
        state.shutdown("first");
        state.shutdown("second");
        assert!(shell.is_closed());
    }

    #[tokio::test]
    async fn test_shell_output_fanned_out_then_exit_shuts_down() {
        let (state, _shell, mut regs) = setup(&["HOST", "alice"]);
        let (tx, rx) = mpsc::channel(8);

        tx.send(ShellEvent::Output(b"$ ".to_vec())).await.unwrap();
        tx.send(ShellEvent::Exited).await.unwrap();
        run_shell_output(state.clone(), rx).await;

        assert!(state.is_shutting_down());
        for reg in &mut regs {
            assert_eq!(
                drain(reg),
                vec![
                    ServerMessage::Text("$ ".into()),
                    ServerMessage::Control(ControlVerb::QuitApproved),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_shell_error_shuts_down() {
        let (state, shell, _regs) = setup(&["HOST"]);
        let (tx, rx) = mpsc::channel(8);
        tx.send(ShellEvent::Error("EIO".into())).await.unwrap();

        run_shell_output(state.clone(), rx).await;

        assert!(state.is_shutting_down());
        assert!(shell.is_closed());
    }
}
