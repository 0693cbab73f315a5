//! Logging in tests works differently than in production: events go to the test writer so
//! `cargo test` captures them per test, and the subscriber is installed exactly once no matter
//! how many tests ask for it.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Install a `tracing` subscriber for tests.  Safe to call from every test; only the first call
/// does anything.
///
/// The filter comes from `RUST_LOG`, defaulting to `debug` for workspace crates with the noisy
/// HTTP internals quieted down.
pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("h2=warn,hyper=info,rustls=info,aws=info,debug"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}
