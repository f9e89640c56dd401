//! Tracing setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! the embedding application's job. These helpers cover the common case:
//! environment-filtered, compact console output.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a console subscriber honoring `RUST_LOG`, defaulting to `info`
/// for this crate. Safe to call more than once; later calls are no-ops,
/// as is calling it when the application already installed a subscriber.
pub fn init() {
    init_with_level(Level::INFO);
}

/// Like [`init`] but with an explicit default level.
pub fn init_with_level(level: Level) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("fcdev={level}")));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_thread_names(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_level(Level::DEBUG);
        tracing::info!("subscriber installed");
    }
}
