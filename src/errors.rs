//! Errors surfaced by the standby engine.
//!
//! Every error is returned synchronously to the caller; nothing in
//! this crate retries on its own. Retry and backoff belong to the
//! scheduler driving the task.

use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::{Offset, Partition, TaskId};

/// Error type collaborators (stores, log transports) hand back to
/// us. We never inspect it, only carry it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type used in the crate.
pub type Result<T, E = StandbyError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StandbyError {
    /// The task could not be built. Fatal to this task instance; the
    /// scheduler has to tear it down and may build a new one.
    #[error("({location}) task {task} failed to initialize: {reason}")]
    Initialization {
        task: TaskId,
        reason: String,
        location: &'static Location<'static>,
        #[source]
        source: Option<BoxError>,
    },

    /// The committed-offset source could not be queried. Offset
    /// limits are left exactly as they were.
    #[error("unable to query committed offset for {partition}")]
    OffsetQuery {
        partition: Partition,
        #[source]
        source: BoxError,
    },

    /// A change-log record could not be written into its store. The
    /// applied position of the partition stays at the last record
    /// that did apply.
    #[error("unable to apply record at offset {offset} of {partition}")]
    Apply {
        partition: Partition,
        offset: Offset,
        #[source]
        source: BoxError,
    },

    /// A store could not make its buffered writes durable. The
    /// checkpoint of every partition it backs is not advanced.
    #[error("unable to flush store {store:?}")]
    Flush {
        store: String,
        #[source]
        source: BoxError,
    },

    /// A change-log partition could not be read or positioned.
    #[error("unable to read change-log partition {partition}")]
    Changelog {
        partition: Partition,
        #[source]
        source: BoxError,
    },

    /// A direct read or write of an active task's store failed.
    #[error("error accessing store {store:?}")]
    Store {
        store: String,
        #[source]
        source: BoxError,
    },

    #[error("no store named {0:?} in this task")]
    UnknownStore(String),

    #[error("partition {0} is not assigned to this task")]
    UnassignedPartition(Partition),

    /// The operation is refused by this kind of processor context.
    #[error("{0} is not supported by this processor context")]
    Unsupported(&'static str),

    #[error("error accessing offset checkpoint at {path:?}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StandbyError {
    /// Build an initialization error without an underlying cause.
    #[track_caller]
    pub(crate) fn init(task: TaskId, reason: impl Into<String>) -> Self {
        Self::Initialization {
            task,
            reason: reason.into(),
            location: Location::caller(),
            source: None,
        }
    }

    /// Is this error fatal to the task instance?
    ///
    /// Anything else leaves the task in a state where the same call
    /// can be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization { .. } | Self::Config(..))
    }
}

/// Wrap any error raised while building a task into
/// [`StandbyError::Initialization`], keeping track of where it
/// happened.
///
/// Example:
///     factory.open(spec, &ctx).init_err(id, "can't open store")?;
pub(crate) trait InitContext<T> {
    #[track_caller]
    fn init_err(self, task: TaskId, reason: &str) -> Result<T>;
}

impl<T, E> InitContext<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    #[track_caller]
    fn init_err(self, task: TaskId, reason: &str) -> Result<T> {
        let location = Location::caller();
        self.map_err(|err| {
            // Initialization errors raised deeper down already say
            // what went wrong; don't wrap them twice.
            let err: BoxError = err.into();
            match err.downcast::<StandbyError>() {
                Ok(err) if matches!(*err, StandbyError::Initialization { .. }) => *err,
                other => StandbyError::Initialization {
                    task,
                    reason: reason.to_string(),
                    location,
                    source: Some(other.map_or_else(|err| err, |err| err as BoxError)),
                },
            }
        })
    }
}

/// Prepend the name of the current thread to each line, if present.
///
/// Used when logging multi-line error chains from a worker thread.
pub fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

/// Render an error and all of its causes, one per line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(&format!("\nCaused by => {cause}"));
        source = cause.source();
    }
    out
}

#[test]
fn init_err_tracks_caller() {
    let res: std::result::Result<(), std::io::Error> =
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
    let err = res.init_err(TaskId::new(0, 1), "can't open store").unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.contains("task 0_1"), "{msg}");
    assert!(err.is_fatal());
}

#[test]
fn init_err_keeps_existing_init_error() {
    let inner = StandbyError::init(TaskId::new(2, 3), "locked");
    let res: Result<()> = Err(inner);
    let err = res.init_err(TaskId::new(2, 3), "outer").unwrap_err();
    match err {
        StandbyError::Initialization { reason, .. } => assert_eq!(reason, "locked"),
        err => panic!("unexpected {err:?}"),
    }
}

#[test]
fn init_err_wraps_other_standby_errors() {
    let res: Result<()> = Err(StandbyError::UnknownStore("counts".to_string()));
    let err = res.init_err(TaskId::new(2, 3), "can't open store").unwrap_err();
    match &err {
        StandbyError::Initialization { reason, source, .. } => {
            assert_eq!(reason, "can't open store");
            let source = source.as_ref().unwrap();
            assert!(matches!(
                source.downcast_ref::<StandbyError>(),
                Some(StandbyError::UnknownStore(name)) if name == "counts"
            ));
        }
        err => panic!("unexpected {err:?}"),
    }
}

#[test]
fn error_chain_lists_causes() {
    let err = StandbyError::Flush {
        store: "counts".to_string(),
        source: "disk full".into(),
    };
    let found = error_chain(&err);
    assert_eq!(found, "unable to flush store \"counts\"\nCaused by => disk full");
    assert!(!err.is_fatal());
}

#[test]
fn prepend_tname_prefixes_each_line() {
    let found = std::thread::Builder::new()
        .name("standby-0_1".to_string())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<standby-0_1> a\n<standby-0_1> b\n");
}
