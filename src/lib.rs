//! ctfgate - challenge instance scaffold
//!
//! This library runs a challenge in two phases and exposes it through one
//! HTTP endpoint:
//! - `build` runs once, records state and stops everything it started
//! - `run` restores that state, starts the challenge and serves it
//! - Declared path mappings are reverse proxied to local backends
//! - A mapping can put a filter process (such as a JSON-RPC method filter)
//!   in front of its backend
//! - Built-in `/info`, `/files` and `/solved` endpoints report on the challenge

pub mod challenge;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod filters;
pub mod net;
pub mod phase;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod router;
pub mod schedule;
pub mod server;
pub mod state;
pub mod template;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
