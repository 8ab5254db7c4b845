//! Logging initialization.
//!
//! One `tracing_subscriber` fmt layer filtered by `RUST_LOG`, falling back
//! to the caller's default directive. Safe to call more than once — later
//! calls are no-ops.

use tracing_subscriber::EnvFilter;

/// Initialize global logging.
///
/// `default_directive` is used when `RUST_LOG` is unset, e.g. `"info"` or
/// `"quill=debug,info"`.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("info");
        init("debug");
        tracing::info!("logging initialized twice without panic");
    }
}
