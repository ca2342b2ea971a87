//! Logging initialization helper for embedders.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize `env_logger` once, defaulting to `info` when `RUST_LOG` is
/// unset. Safe to call from multiple entry points (server startup, tests).
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();
    });
}
