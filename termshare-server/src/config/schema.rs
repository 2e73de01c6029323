//! Configuration schema structs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use termshare_protocol::DEFAULT_MAX_LINE_LENGTH;

use crate::registry::{DEFAULT_PEER_NAME, DEFAULT_QUEUE_CAPACITY};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub shell: ShellConfig,
}

/// Listener and session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub listen_addr: String,
    /// Username reserved for the host console (the default editor)
    pub host_name: String,
    /// Capacity of each peer's outbound queue; overflow is dropped
    pub outbound_queue_capacity: usize,
    /// Deadline for the `HELLO` line after accept
    pub handshake_timeout_secs: u64,
    /// Auto-deny a control request the host has not answered in time
    pub decision_timeout_secs: Option<u64>,
    /// Drop data lines from peers that are not the editor
    pub enforce_editor_input: bool,
    /// Only the current editor may give control back
    pub restrict_give_back: bool,
    /// Longest accepted line in bytes
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".into(),
            host_name: DEFAULT_PEER_NAME.into(),
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake_timeout_secs: 5,
            decision_timeout_secs: None,
            enforce_editor_input: false,
            restrict_give_back: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        self.decision_timeout_secs.map(Duration::from_secs)
    }
}

/// Shared shell settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Program to run; `$SHELL` or `/bin/sh` when unset
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Working directory; inherited when unset
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["-i".into()],
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl ShellConfig {
    /// Program that will actually be spawned
    pub fn resolved_command(&self) -> String {
        self.command
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".into())
    }
}
