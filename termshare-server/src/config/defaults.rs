//! Default configuration values
//!
//! These are embedded in the binary and used when no config file exists.

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# termshare configuration

[server]
listen_addr = "127.0.0.1:9090"
host_name = "HOST"
outbound_queue_capacity = 100
handshake_timeout_secs = 5
# decision_timeout_secs = 60
enforce_editor_input = false
restrict_give_back = false
max_line_length = 65536

[shell]
# command = "/bin/bash"
args = ["-i"]
# cwd = "/home/me/project"

[shell.env]
# TERM = "xterm-256color"
"##;
