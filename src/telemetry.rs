// src/telemetry.rs
//
// Process-wide log sink. Library code only talks to the `log` / `tracing`
// facades; the binary (or an embedding process) calls `init_logging` once.

use crate::settings::LogSettings;

/// Installs `env_logger` filtered by `settings.level` unless `RUST_LOG` is set.
/// Calling it twice is harmless.
#[cfg(not(feature = "observability"))]
pub fn init_logging(settings: &LogSettings) {
    let env = env_logger::Env::default().default_filter_or(settings.level.as_str());
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

/// Installs a `tracing-subscriber` fmt subscriber, json or pretty per
/// `settings.format`. `try_init` also installs the `tracing-log` `LogTracer`,
/// which forwards the crate's `log` records into that subscriber.
#[cfg(feature = "observability")]
pub fn init_logging(settings: &LogSettings) {
    use crate::settings::LogFormat;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let _ = match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let settings = LogSettings::default();
        init_logging(&settings);
        init_logging(&settings);
        log::info!("logging initialized");
    }

    #[test]
    fn test_log_records_are_enabled_after_init() {
        init_logging(&LogSettings::default());
        assert_ne!(log::max_level(), log::LevelFilter::Off);
    }
}
