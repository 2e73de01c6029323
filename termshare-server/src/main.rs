//! termshare-host - share a shell with other terminals
//!
//! Spawns the shell, serves peers, and attaches this terminal to the session
//! as the default peer.

use std::sync::Arc;

use tracing::{error, info};

use termshare_client::commands::USAGE;
use termshare_client::{run_console, spawn_stdin_reader, Connection, Role};
use termshare_server::{ConfigLoader, PtyShell, Server};
use termshare_utils::{init_logging_with_config, LogConfig, Result};

mod cli;

use cli::Args;

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };
    args.apply(&mut config);
    ConfigLoader::validate(&config)?;

    let (shell, events) = PtyShell::spawn(&config.shell)?;
    let host_name = config.server.host_name.clone();
    let server = Server::bind(config.server, Arc::new(shell)).await?;
    let addr = server.local_addr()?;
    let state = server.state().clone();

    let server_task = tokio::spawn(server.run(events));

    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                state.shutdown("interrupted");
            }
        });
    }

    println!("Sharing terminal on {} as {}. {}", addr, host_name, USAGE);

    match Connection::connect(&addr.to_string(), &host_name).await {
        Ok(conn) => {
            if let Err(e) = run_console(conn, Role::Host, spawn_stdin_reader(), std::io::stdout()).await {
                error!(error = %e, "Host console ended");
            }
        }
        Err(e) => error!(error = %e, "Host console failed to join"),
    }
    state.shutdown("host console closed");

    match server_task.await {
        Ok(result) => result,
        Err(e) => Err(termshare_utils::TermshareError::internal(format!(
            "server task failed: {}",
            e
        ))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    let log_config = if args.debug {
        LogConfig::development()
    } else {
        LogConfig::host()
    };
    init_logging_with_config(log_config)?;

    info!("termshare host starting");
    run(args).await
}
