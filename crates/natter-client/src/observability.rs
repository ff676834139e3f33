//! Tracing bootstrap for binaries and tests that embed the client.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the process. `init_tracing` installs a fmt layer filtered by `RUST_LOG`
//! (default `info`) and is safe to call more than once.

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        // Use environment variable for log filtering; default to "info" if unset or invalid.
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Another global subscriber may already be installed by the host process.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
}
