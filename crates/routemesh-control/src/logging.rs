//! Logging lifecycle at process boundaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber: `fmt` output filtered by `RUST_LOG`,
/// `info` when unset. Calling it again is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("logging initialised");
    }
}

/// Flushes logging before the process exits. The `fmt` writer is
/// synchronous, so only a final record is emitted.
pub fn flush() {
    tracing::info!("shutting down");
}
