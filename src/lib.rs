//! Proxy Harvester - Concurrent proxy crawler and validator
//!
//! Walks proxy listing sites for `IP:PORT` candidates and probes each one
//! through itself against judge pages to learn which protocols it serves and
//! whether it hides the caller's address.

pub mod proxy;

pub use proxy::*;

use tracing_subscriber::EnvFilter;

/// Application result type
pub type Result<T> = anyhow::Result<T>;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_directive`
/// when it is unset
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}
