//! Shared test helpers.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing output for tests. Safe to call repeatedly; the first
/// call wins.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}
