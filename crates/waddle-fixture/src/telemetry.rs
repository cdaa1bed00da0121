//! Tracing setup for tests that drive fixtures.

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber that writes through libtest's output capture.
///
/// Safe to call from every test; only the first call installs anything. If a
/// subscriber is already set (by another harness, say) it is left alone.
///
/// # Configuration
///
/// - `RUST_LOG`: Log filter (default: `info,waddle_fixture=debug`)
pub fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,waddle_fixture=debug"));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_test_writer();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
}
