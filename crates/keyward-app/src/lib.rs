//! Keyward daemon support.
//!
//! The binary in `main.rs` wires storage, the HTTP server and discovery
//! together; this library holds the platform pieces it needs.
//!
//! - Autostart at login and background launch ([`Autostart`])

pub mod autostart;

pub use autostart::{Autostart, DAEMON_ARGS};
