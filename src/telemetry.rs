//! Logging initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::config::LoggingConfig;

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub verbose: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbose: u8, logging: LoggingConfig) -> Self {
        Self { verbose, logging }
    }

    fn directive(&self) -> String {
        match self.verbose {
            0 => self.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// Keeps the subscriber installed; hold it for the process lifetime.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level; a second call is a no-op so tests can init freely.
pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directive()));
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
    TelemetryGuard { _private: () }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_escalates_the_directive() {
        let logging = LoggingConfig::default();
        assert_eq!(TelemetryConfig::new(0, logging.clone()).directive(), "info");
        assert_eq!(TelemetryConfig::new(1, logging.clone()).directive(), "debug");
        assert_eq!(TelemetryConfig::new(3, logging).directive(), "trace");
    }

    #[test]
    fn init_twice_is_harmless() {
        let _a = init(TelemetryConfig::new(0, LoggingConfig::default()));
        let _b = init(TelemetryConfig::new(0, LoggingConfig::default()));
    }
}
