use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `info`. Calling this
/// twice is harmless; the second subscriber is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
