//! # Logging Setup
//!
//! Thin wrappers around `env_logger`. The crate itself only emits through
//! the `log` facade; embedders may install any compatible logger instead
//! of calling these.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes env_logger once, honoring `RUST_LOG` and defaulting to
/// `info`. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();
    });
}

/// Initializes logging for tests: debug level, output captured by the
/// test harness. Repeat calls are ignored.
pub fn init_for_tests() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .unwrap_or(());
}
