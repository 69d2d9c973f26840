//! Tracing bootstrap shared by stratofs binaries and tests.

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Filtering follows `RUST_LOG`; `default_directive` applies when the
/// environment says nothing (e.g. `"strato_cache=debug"`). Safe to call
/// more than once; later calls are no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        default_directive
            .parse()
            .map(|directive| EnvFilter::default().add_directive(directive))
            .unwrap_or_default()
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
