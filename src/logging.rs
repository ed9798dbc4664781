//! Tracing setup for hosts embedding the engine.

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber filtered by `level` (an `EnvFilter`
/// directive such as `"info"` or `"notegraph=debug"`).
///
/// Logs go to stderr so stdout stays free for the host. A malformed directive
/// falls back to `info`. Calling this twice is harmless: the second install
/// is ignored.
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
