//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "MUXCTL_LOG";

/// Filter from `MUXCTL_LOG`, else the configured directive, else
/// `muxctl=info` when the directive does not parse.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new(LoggingConfig::default().filter))
}

/// Install the stderr subscriber. Later calls leave the first one in place.
pub fn init_tracing(config: &LoggingConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig {
            filter: "muxctl=debug".to_string(),
            ansi: false,
        };
        init_tracing(&config);
        init_tracing(&config);
        tracing::debug!("logging initialized twice");
    }
}
