//! benebot: a chat assistant that relays Telegram conversations to Gemini.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod agent;
pub mod capabilities;
pub mod comm;
pub mod config;
pub mod models;
pub mod session;
pub mod telegram;
pub mod trigger;
pub mod utils;

/// Return the benebot home directory.
///
/// Resolution order:
/// 1. `BENEBOT_HOME` environment variable
/// 2. `<config dir>/benebot` (e.g. `~/.config/benebot`)
pub fn benebot_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("BENEBOT_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("benebot")
    }
}
