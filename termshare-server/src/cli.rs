//! Command-line argument parsing for the termshare host
//!
//! Flags override values from the config file.

use std::path::PathBuf;

use clap::Parser;

use termshare_server::AppConfig;

/// termshare-host - share a shell with other terminals
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (host:port)
    #[arg(long, short = 'l', env = "TERMSHARE_LISTEN")]
    pub listen: Option<String>,

    /// Name the host console joins as
    #[arg(long)]
    pub name: Option<String>,

    /// Config file (defaults to the XDG config location)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Shell program to share
    #[arg(long)]
    pub shell: Option<String>,

    /// Auto-deny control requests not answered within this many seconds
    #[arg(long)]
    pub decision_timeout: Option<u64>,

    /// Drop input from peers that are not the editor
    #[arg(long, default_value_t = false)]
    pub enforce_editor_input: bool,

    /// Only the current editor may give control back
    #[arg(long, default_value_t = false)]
    pub restrict_give_back: bool,

    /// Log to stderr at debug level instead of the log file
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl Args {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Apply flags on top of a loaded configuration
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(name) = &self.name {
            config.server.host_name = name.clone();
        }
        if let Some(shell) = &self.shell {
            config.shell.command = Some(shell.clone());
        }
        if self.decision_timeout.is_some() {
            config.server.decision_timeout_secs = self.decision_timeout;
        }
        if self.enforce_editor_input {
            config.server.enforce_editor_input = true;
        }
        if self.restrict_give_back {
            config.server.restrict_give_back = true;
        }
    }
}
