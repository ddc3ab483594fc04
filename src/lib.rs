//! claw_relay: durable message relay with crash recovery and a
//! leader-elected capability registry.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod cache;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod gateway;
pub mod logs;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod store;
pub mod utils;
pub mod value_tree;
pub mod worker;

/// Return the relay home directory.
///
/// Resolution order:
/// 1. `RELAY_HOME` environment variable
/// 2. `$HOME/.claw_relay`
pub fn relay_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("RELAY_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".claw_relay")
    }
}
