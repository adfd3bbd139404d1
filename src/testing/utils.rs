//! Small helpers shared by tests.

/// Install a `tracing` subscriber honouring `RUST_LOG`, defaulting to `filter`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing(filter: &str) {
    let env = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_test_writer()
        .try_init();
}
