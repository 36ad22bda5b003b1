//! Common test setup for integration tests.
#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a global tracing subscriber for test output. Safe to call from
/// every test; only the first call has any effect.
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}
