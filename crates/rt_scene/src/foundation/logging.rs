//! Logging utilities
//!
//! The crate logs through the `log` facade; binaries and tests pick the sink.

pub use log::{debug, info, warn, error, trace};

/// Initialize the logging system from `RUST_LOG`
pub fn init() {
    env_logger::init();
}

/// Initialize logging with a default filter when `RUST_LOG` is unset
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

/// Initialize logging for unit tests (captured by the test harness)
#[cfg(test)]
pub fn init_for_tests() {
    let _ = env_logger::builder().is_test(true).try_init();
}
