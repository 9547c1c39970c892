//! nvhubd: keeps one editor instance per project and brokers between the
//! `nvhub` CLI, the desktop, and an optional long-lived editor host.

pub mod config;
pub mod control;
pub mod focus;
pub mod handoff;
pub mod host;
pub mod naming;
pub mod normalize;
pub mod notify;
pub mod poll;
pub mod process;
pub mod projects;
pub mod registry;
pub mod snapshot;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating to zero on a clock before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
