//! Structured logging setup shared by the CLI and the HTTP service.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading its filter from
/// `RUST_LOG` (defaulting to `info`), emitting either human-readable or
/// newline-delimited JSON records.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
