//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// when a subscriber was already installed, so calling this from several
/// tests is harmless.
pub fn init(config: &LoggingConfig) -> bool {
    let default_level: tracing::Level = config.level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };

    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            colored: false,
            ..Default::default()
        };
        init(&config);
        assert!(!init(&config));
    }
}
