//! termshare - join a shared terminal session

use std::io::{BufRead, Write};
use std::time::Duration;

use tracing::info;

use termshare_client::cli::Args;
use termshare_client::commands::USAGE;
use termshare_client::{run_console, spawn_stdin_reader, Connection, Role};
use termshare_utils::{init_logging_with_config, LogConfig, Result, TermshareError};

/// Print `label` and read one trimmed, non-empty line from stdin
fn prompt(label: &str) -> Result<String> {
    let stdin = std::io::stdin();
    loop {
        print!("{}", label);
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Err(TermshareError::ConnectionClosed);
        }
        let line = line.trim();
        if !line.is_empty() {
            return Ok(line.to_string());
        }
    }
}

/// Join the session, asking for another name while the chosen one is taken
async fn join(addr: &str, mut name: Option<String>, timeout: Duration) -> Result<Connection> {
    loop {
        let username = match name.take() {
            Some(name) => name,
            None => prompt("Username: ")?,
        };

        match Connection::connect_with_timeout(addr, &username, timeout).await {
            Ok(conn) => return Ok(conn),
            Err(TermshareError::NameTaken(taken)) => {
                println!("Username '{}' is already taken, please choose another.", taken);
            }
            Err(e) => return Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    init_logging_with_config(LogConfig::client())?;

    let addr = match args.addr {
        Some(addr) => addr,
        None => prompt("Server address (host:port): ")?,
    };

    let conn = join(&addr, args.name, Duration::from_secs(args.timeout)).await?;
    info!(username = conn.username(), "termshare client connected");
    println!("Connected as {}. {}", conn.username(), USAGE);

    run_console(conn, Role::Guest, spawn_stdin_reader(), std::io::stdout()).await
}
