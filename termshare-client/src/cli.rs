//! Command-line argument parsing for the termshare client
//!
//! Uses clap for argument parsing with derive macros.

use clap::Parser;

/// termshare - join a shared terminal session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Server address (host:port or tcp://host:port)
    ///
    /// Prompted for when omitted.
    #[arg(env = "TERMSHARE_ADDR")]
    pub addr: Option<String>,

    /// Username to join as
    ///
    /// Prompted for when omitted, and again if the name is taken.
    #[arg(long, short = 'n')]
    pub name: Option<String>,

    /// Seconds to wait for the server to accept the handshake
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,
}

impl Args {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
