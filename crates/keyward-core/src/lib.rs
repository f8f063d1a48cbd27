//! Keyward Core - discovery, consent, pricing, and authentication logic.
//!
//! This crate holds the pieces of the broker that do not touch HTTP routing
//! or SQL:
//!
//! - [`discovery`]: the per-user service descriptor and liveness probe
//! - [`consent`]: pending grant sessions and their one-shot decisions
//! - [`token`]: short-lived consent tokens for the consent UI
//! - [`auth`]: the local dashboard account and login sessions
//! - [`pricing`]: the static model price table
//! - [`external`]: seams for opening URLs and installing the daemon

pub mod auth;
pub mod consent;
pub mod discovery;
pub mod external;
pub mod pricing;
pub mod token;

/// Crate version reported by the identity endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
