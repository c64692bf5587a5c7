//! Tracing bootstrap

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_directive` (e.g. `"info"` or `"rivven_etl=debug"`)
/// when `RUST_LOG` is unset or invalid. Calling it again, or after another
/// subscriber was installed, is a no-op; returns whether this call installed
/// the subscriber.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Like [`init_tracing`], writing through the test harness capture
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rivven_etl=debug")),
        )
        .with_test_writer()
        .try_init();
}
