//! termshare-client: console client for a shared terminal session
//!
//! Used both by the `termshare` binary (guests) and by the host binary,
//! which attaches its own console to the server as the default peer.

pub mod cli;
pub mod commands;
pub mod connection;
pub mod console;

pub use commands::{parse_command, Command};
pub use connection::{parse_address, Connection, WELCOME_TIMEOUT};
pub use console::{run_console, spawn_stdin_reader, ConsoleState, InputAction, Role, Shown};
