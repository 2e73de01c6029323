//! termshare-server: multi-peer shared terminal server
//!
//! One shell, many peers. Every peer sees the shell's output; exactly one peer
//! (the editor) is expected to type into it at a time. The host process joins
//! its own listener as the default peer, which starts out as the editor and
//! answers control requests.

pub mod config;
pub mod connection;
pub mod control;
pub mod fanout;
pub mod registry;
pub mod session;
pub mod shell;
pub mod tcp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use termshare_utils::Result;

pub use config::{AppConfig, ConfigLoader, ServerConfig, ShellConfig};
pub use registry::{ClientRegistry, Peer, DEFAULT_PEER_NAME, DEFAULT_QUEUE_CAPACITY};
pub use session::SharedState;
pub use shell::{PtyShell, ShellBackend, ShellEvent};

/// How long shutdown waits for connection tasks to flush
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A bound, not yet running server
pub struct Server {
    state: SharedState,
    listener: TcpListener,
}

impl Server {
    /// Bind the listener described by `config`
    pub async fn bind(config: ServerConfig, shell: Arc<dyn ShellBackend>) -> Result<Self> {
        let listener = tcp::bind(&config.listen_addr).await?;
        Ok(Self {
            state: SharedState::new(config, shell),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Serve until shutdown
    ///
    /// Shell output from `events` is fanned out to every peer. Returns once
    /// the accept loop has stopped and connection tasks have drained.
    pub async fn run(self, events: mpsc::Receiver<ShellEvent>) -> Result<()> {
        let Server { state, listener } = self;

        info!(
            host = %state.registry.default_peer(),
            capacity = state.registry.queue_capacity(),
            "termshare server starting"
        );

        state
            .tasks
            .spawn(session::run_shell_output(state.clone(), events));

        tcp::run_tcp_accept_loop(listener, state.clone()).await;
        state.shutdown("accept loop stopped");

        state.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, state.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = state.tasks.len(),
                "Timed out waiting for connection tasks"
            );
        }

        info!("termshare server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::RecordingShell;
    use futures::{SinkExt, StreamExt};
    use termshare_protocol::{ClientCodec, ClientMessage, ControlVerb, ServerMessage};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_util::codec::Framed;

    type Client = Framed<TcpStream, ClientCodec>;

    struct Harness {
        addr: SocketAddr,
        state: SharedState,
        shell: Arc<RecordingShell>,
        events: mpsc::Sender<ShellEvent>,
        server: JoinHandle<Result<()>>,
    }

    async fn start() -> Harness {
        let shell = Arc::new(RecordingShell::default());
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            ..Default::default()
        };
        let server = Server::bind(config, shell.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state().clone();
        let (events, rx) = mpsc::channel(16);
        let server = tokio::spawn(server.run(rx));
        Harness {
            addr,
            state,
            shell,
            events,
            server,
        }
    }

    async fn join(addr: SocketAddr, name: &str) -> (Client, ServerMessage) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, ClientCodec::new());
        client
            .send(ClientMessage::Hello {
                username: name.into(),
            })
            .await
            .unwrap();
        let reply = next(&mut client).await;
        (client, reply)
    }

    async fn next(client: &mut Client) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for server line")
            .expect("stream ended")
            .expect("codec error")
            .expect("malformed line")
    }

    async fn send(client: &mut Client, message: ClientMessage) {
        client.send(message).await.unwrap();
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_scenario_control_granted_by_host() {
        let h = start().await;
        let (mut host, _) = join(h.addr, "HOST").await;
        let (mut alice, _) = join(h.addr, "alice").await;
        let (mut bob, _) = join(h.addr, "bob").await;

        send(&mut alice, ClientMessage::Control(ControlVerb::RequestControl)).await;
        let prompt = next(&mut host).await;
        assert!(prompt.to_string().contains("alice"));

        send(&mut host, ClientMessage::Data("y".into())).await;

        assert_eq!(
            next(&mut alice).await,
            ServerMessage::Control(ControlVerb::GrantControl)
        );
        let notice = next(&mut bob).await;
        assert!(notice.to_string().contains("alice"));
        assert_eq!(h.state.registry.current_editor(), "alice");

        // The answer never reached the shell; the prompt refresh did
        wait_until(|| h.shell.lines() == vec![String::new()]).await;
    }

    #[tokio::test]
    async fn test_scenario_duplicate_username() {
        let h = start().await;
        let (_bob, reply) = join(h.addr, "bob").await;
        assert!(matches!(reply, ServerMessage::Welcome { .. }));

        let (_bob2, reply) = join(h.addr, "bob").await;
        assert_eq!(reply, ServerMessage::Control(ControlVerb::ClientNameTaken));
        assert_eq!(h.state.registry.peer_names(), vec!["bob"]);
    }

    #[tokio::test]
    async fn test_scenario_editor_input_broadcast() {
        let h = start().await;
        let (mut host, _) = join(h.addr, "HOST").await;
        let (mut alice, _) = join(h.addr, "alice").await;
        let (mut bob, _) = join(h.addr, "bob").await;

        send(&mut host, ClientMessage::Data("hello world".into())).await;

        for peer in [&mut alice, &mut bob] {
            assert_eq!(
                next(peer).await,
                ServerMessage::Text("[HOST] hello world".into())
            );
        }
        wait_until(|| h.shell.lines() == vec!["hello world".to_string()]).await;
    }

    #[tokio::test]
    async fn test_shell_output_reaches_every_peer() {
        let h = start().await;
        let (mut host, _) = join(h.addr, "HOST").await;
        let (mut alice, _) = join(h.addr, "alice").await;

        h.events
            .send(ShellEvent::Output(b"user@box:~$ ".to_vec()))
            .await
            .unwrap();

        for peer in [&mut host, &mut alice] {
            assert_eq!(next(peer).await, ServerMessage::Text("user@box:~$ ".into()));
        }
    }

    #[tokio::test]
    async fn test_host_quit_stops_server() {
        let h = start().await;
        let (mut host, _) = join(h.addr, "HOST").await;
        let (mut alice, _) = join(h.addr, "alice").await;

        send(&mut host, ClientMessage::Control(ControlVerb::Quit)).await;

        for peer in [&mut host, &mut alice] {
            assert_eq!(
                next(peer).await,
                ServerMessage::Control(ControlVerb::QuitApproved)
            );
        }

        let result = tokio::time::timeout(Duration::from_secs(5), h.server)
            .await
            .expect("server did not stop");
        assert!(result.unwrap().is_ok());
        assert!(h.shell.is_closed());
    }

    #[tokio::test]
    async fn test_shell_exit_stops_server() {
        let h = start().await;
        let (mut alice, _) = join(h.addr, "alice").await;

        h.events.send(ShellEvent::Exited).await.unwrap();

        assert_eq!(
            next(&mut alice).await,
            ServerMessage::Control(ControlVerb::QuitApproved)
        );
        let result = tokio::time::timeout(Duration::from_secs(5), h.server).await;
        assert!(result.is_ok());
    }
}
