//! TCP listener for peer connections

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use termshare_utils::{Result, TermshareError};

use crate::connection::handle_client;
use crate::session::SharedState;

/// Bind the peer listener
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| TermshareError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;

    if let Ok(local) = listener.local_addr() {
        info!("TCP listener bound to {}", local);
    }
    Ok(listener)
}

/// Run the TCP accept loop until shutdown
///
/// Accept errors are logged and the loop keeps going.
pub async fn run_tcp_accept_loop(listener: TcpListener, shared_state: SharedState) {
    let shutdown = shared_state.shutdown_token();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("New TCP connection from {}", peer_addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        let state_clone = shared_state.clone();
                        shared_state.tasks.spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_client(reader, writer, state_clone).await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping TCP accept loop");
                break;
            }
        }
    }
}
