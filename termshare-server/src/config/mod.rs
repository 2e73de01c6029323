//! Configuration management for the termshare host
//!
//! Values come from an optional TOML file in the XDG config directory;
//! command-line flags are applied on top by the host binary.

mod defaults;
mod loader;
mod schema;

pub use defaults::DEFAULT_CONFIG_TOML;
pub use loader::ConfigLoader;
pub use schema::*;
