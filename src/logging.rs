//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise the configured
//! `application.log_level` applies to every target.

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Build the filter used by [`init`].
pub fn env_filter(app: &ApplicationConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&app.log_level)
            .with_context(|| format!("invalid log level '{}'", app.log_level)),
    }
}

/// Install the global fmt subscriber, JSON formatted if `app.json_logs`.
///
/// # Errors
/// Fails if the log level does not parse or a global subscriber is already
/// installed.
pub fn init(app: &ApplicationConfig) -> Result<()> {
    let filter = env_filter(app)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if app.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(instrument = %app.name, level = %app.log_level, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing::level_filters::LevelFilter;

    fn app(level: &str) -> ApplicationConfig {
        ApplicationConfig {
            name: "HiSeq A".to_string(),
            log_level: level.to_string(),
            json_logs: false,
        }
    }

    #[test]
    #[serial]
    fn test_filter_from_config_level() {
        std::env::remove_var("RUST_LOG");
        let filter = env_filter(&app("debug")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    #[serial]
    fn test_rust_log_takes_precedence() {
        std::env::set_var("RUST_LOG", "tdi_daq=trace");
        let filter = env_filter(&app("warn")).unwrap();
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    #[serial]
    fn test_init_installs_global_subscriber_once() {
        std::env::remove_var("RUST_LOG");
        // Another test may already own the global subscriber.
        let _ = init(&app("info"));

        let err = init(&ApplicationConfig {
            json_logs: true,
            ..app("debug")
        })
        .unwrap_err();
        assert!(err.to_string().contains("tracing subscriber"));
    }
}
