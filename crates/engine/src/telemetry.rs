//! Log subscriber installation
//!
//! Library code only emits `tracing` events. Binaries and tests that want
//! to see them call [`init`] once at startup.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, or by the configured
/// level when `RUST_LOG` is unset.
///
/// Returns false if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
