//! Settings of a standby deployment.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Result;
use crate::errors::StandbyError;

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_commit_interval_ms() -> u64 {
    30_000
}

fn default_poll_max_records() -> usize {
    1000
}

fn default_log_level() -> String {
    "error".to_string()
}

/// Configure where state lives and how often progress is made
/// durable.
///
/// Every field has a default, so `{}` is a valid config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StandbyConfig {
    /// Root directory; every task gets its own subdirectory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Time between two commits of a running task.
    ///
    /// Each commit flushes the stores and checkpoints their
    /// positions, so this bounds how much is replayed after a crash.
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    /// Most records fetched per partition per poll.
    #[serde(default = "default_poll_max_records")]
    pub poll_max_records: usize,
    /// Level of this crate's logs, see [`Self::setup_logging`].
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            commit_interval_ms: default_commit_interval_ms(),
            poll_max_records: default_poll_max_records(),
            log_level: default_log_level(),
        }
    }
}

impl StandbyConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| StandbyError::Config(format!("can't read {path:?}: {err}")))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| StandbyError::Config(format!("can't parse {path:?}: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.commit_interval_ms == 0 {
            return Err(StandbyError::Config(
                "commit_interval_ms must be positive".to_string(),
            ));
        }
        if self.poll_max_records == 0 {
            return Err(StandbyError::Config(
                "poll_max_records must be positive".to_string(),
            ));
        }
        crate::logging::parse_level(&self.log_level)?;
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    /// Install the global log subscriber at [`Self::log_level`].
    pub fn setup_logging(&self) -> Result<()> {
        crate::logging::setup(Some(&self.log_level))
    }
}

#[test]
fn empty_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("standby.json");
    fs::write(&path, "{}").unwrap();

    let config = StandbyConfig::from_file(&path).unwrap();

    assert_eq!(config, StandbyConfig::default());
    assert_eq!(config.commit_interval(), Duration::from_secs(30));
}

#[test]
fn from_file_reads_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("standby.json");
    fs::write(
        &path,
        r#"{"state_dir": "/var/lib/standby", "commit_interval_ms": 500, "log_level": "DEBUG"}"#,
    )
    .unwrap();

    let config = StandbyConfig::from_file(&path).unwrap();

    assert_eq!(config.state_dir, PathBuf::from("/var/lib/standby"));
    assert_eq!(config.commit_interval(), Duration::from_millis(500));
    assert_eq!(config.poll_max_records, 1000);
}

#[test]
fn invalid_values_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("standby.json");

    for text in [
        r#"{"commit_interval_ms": 0}"#,
        r#"{"poll_max_records": 0}"#,
        r#"{"log_level": "loud"}"#,
        r#"{"commit_every": 10}"#,
        "not json",
    ] {
        fs::write(&path, text).unwrap();
        assert!(
            matches!(StandbyConfig::from_file(&path), Err(StandbyError::Config(_))),
            "{text} should be rejected"
        );
    }
}

#[test]
fn missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();

    let err = StandbyConfig::from_file(&dir.path().join("nope.json")).unwrap_err();

    assert!(err.is_fatal());
}

#[test]
fn setup_logging_uses_configured_level() {
    let config = StandbyConfig {
        log_level: "debug".to_string(),
        ..StandbyConfig::default()
    };
    config.setup_logging().unwrap();

    let config = StandbyConfig {
        log_level: "loud".to_string(),
        ..StandbyConfig::default()
    };
    assert!(matches!(
        config.setup_logging(),
        Err(StandbyError::Config(_))
    ));
}
