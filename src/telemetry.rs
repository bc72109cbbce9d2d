//! Logging bootstrap for host applications

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// keeps the first subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}
