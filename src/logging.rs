//! Logging setup.
//!
//! Everything in this crate logs through [`tracing`]. Installing a
//! subscriber is left to the embedding process; [`setup`] is a
//! ready-made one that writes compact lines to stdout.
//!
//! Logs are filtered to this crate's target at the configured level.
//! Setting `STANDBY_LOG` replaces that filter with any
//! [`EnvFilter`] directive, e.g. `STANDBY_LOG=standby_replica=trace`.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::Result;
use crate::errors::StandbyError;

/// Env var holding filter directives that override the configured
/// level.
pub const LOG_ENV_VAR: &str = "STANDBY_LOG";

const TARGET: &str = "standby_replica";

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        level => Err(StandbyError::Config(format!("wrong log level: {level}"))),
    }
}

/// Install a global subscriber logging at `level`, or `error` if
/// unset.
pub fn setup(level: Option<&str>) -> Result<()> {
    let level = level.map(parse_level).transpose()?.unwrap_or(LevelFilter::ERROR);

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                StandbyError::Config(format!("bad {LOG_ENV_VAR} value {directives:?}: {err}"))
            })?;
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
        Err(_) => {
            let filter = Targets::new().with_target(TARGET, level);
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)));
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if logging was already set up, which happens in
    // tests and when embedded in a process with its own subscriber.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn parse_level_ignores_case() {
    assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
    assert_eq!(parse_level("warn").unwrap(), LevelFilter::WARN);
    assert!(parse_level("verbose").is_err());
}

#[test]
fn setup_twice_does_not_fail() {
    setup(Some("info")).unwrap();
    setup(None).unwrap();
}
