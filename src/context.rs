//! The handle stores get while a task initializes them.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use crate::codec::Serde;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::TaskId;
use crate::topology::Topology;

/// What kind of task owns a context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContextKind {
    /// Serves the partition and runs user logic elsewhere.
    Active,
    /// Only replays change-logs. Never runs user logic.
    Standby,
}

/// Task identity, state location and serializers, as seen by the
/// stores of one task.
///
/// A standby context refuses every operation that would drive user
/// processing logic.
#[derive(Debug)]
pub struct ProcessorContext {
    task_id: TaskId,
    state_dir: PathBuf,
    kind: ContextKind,
    /// Store name to `(key_serde, value_serde)`.
    serdes: BTreeMap<String, (Serde, Serde)>,
    initialized: bool,
    commit_requested: bool,
}

impl ProcessorContext {
    pub fn new(task_id: TaskId, state_dir: &Path, kind: ContextKind, topology: &Topology) -> Self {
        let serdes = topology
            .stores()
            .iter()
            .map(|spec| (spec.name.clone(), (spec.key_serde, spec.value_serde)))
            .collect();
        Self {
            task_id,
            state_dir: state_dir.to_path_buf(),
            kind,
            serdes,
            initialized: false,
            commit_requested: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Directory this task's stores keep their files in.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn key_serde(&self, store: &str) -> Option<Serde> {
        self.serdes.get(store).map(|(key, _value)| *key)
    }

    pub fn value_serde(&self, store: &str) -> Option<Serde> {
        self.serdes.get(store).map(|(_key, value)| *value)
    }

    /// Check a store may still be opened with this context.
    pub fn register(&self, store: &str) -> Result<()> {
        if self.initialized {
            return Err(StandbyError::init(
                self.task_id,
                format!("store {store:?} registered after the stores were initialized"),
            ));
        }
        if !self.serdes.contains_key(store) {
            return Err(StandbyError::init(
                self.task_id,
                format!("store {store:?} is not part of the topology"),
            ));
        }
        Ok(())
    }

    /// Mark the end of store initialization.
    pub fn initialized(&mut self) {
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Hand a record to downstream processors.
    ///
    /// The processing pipeline is not hosted here, so there is
    /// nothing downstream for either kind of task.
    pub fn forward(&mut self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(StandbyError::Unsupported("forward"))
    }

    /// Ask for a punctuation callback.
    pub fn schedule(&mut self, _interval_ms: u64) -> Result<()> {
        Err(StandbyError::Unsupported("schedule"))
    }

    /// Ask the owning task to commit as soon as possible.
    pub fn request_commit(&mut self) -> Result<()> {
        match self.kind {
            ContextKind::Standby => Err(StandbyError::Unsupported("request_commit")),
            ContextKind::Active => {
                self.commit_requested = true;
                Ok(())
            }
        }
    }

    /// Was a commit requested since the last call?
    pub fn take_commit_request(&mut self) -> bool {
        std::mem::take(&mut self.commit_requested)
    }
}

#[cfg(test)]
fn test_context(kind: ContextKind) -> ProcessorContext {
    use crate::topology::StoreSpec;

    let topo = Topology::new(vec![
        StoreSpec::new("counts", "counts-changelog").with_serdes(Serde::Utf8, Serde::Json)
    ])
    .unwrap();
    ProcessorContext::new(TaskId::new(0, 0), Path::new("/tmp/x"), kind, &topo)
}

#[test]
fn standby_refuses_processing() {
    let mut ctx = test_context(ContextKind::Standby);

    assert!(matches!(
        ctx.forward(b"k", b"v"),
        Err(StandbyError::Unsupported("forward"))
    ));
    assert!(matches!(
        ctx.schedule(1000),
        Err(StandbyError::Unsupported("schedule"))
    ));
    assert!(matches!(
        ctx.request_commit(),
        Err(StandbyError::Unsupported("request_commit"))
    ));
    assert!(!ctx.take_commit_request());
}

#[test]
fn active_records_commit_requests() {
    let mut ctx = test_context(ContextKind::Active);

    ctx.request_commit().unwrap();
    assert!(ctx.take_commit_request());
    assert!(!ctx.take_commit_request());
}

#[test]
fn register_closes_after_initialized() {
    let mut ctx = test_context(ContextKind::Standby);

    assert_eq!(ctx.key_serde("counts"), Some(Serde::Utf8));
    assert_eq!(ctx.value_serde("counts"), Some(Serde::Json));
    ctx.register("counts").unwrap();
    assert!(ctx.register("other").is_err());

    ctx.initialized();
    assert!(ctx.is_initialized());
    assert!(ctx.register("counts").is_err());
}
