//! Tasks: the unit of work the scheduler assigns to a node.
//!
//! Both kinds of task own the same capabilities: an id, a set of
//! change-log partitions, a [`StateManager`] over those partitions and
//! a [`ProcessorContext`] for their stores. These live in a
//! [`TaskCore`] each kind holds, and [`Task`] exposes them.

use std::path::Path;

use crate::context::ContextKind;
use crate::context::ProcessorContext;
use crate::errors::Result;
use crate::model::Partition;
use crate::model::TaskId;
use crate::state_dir::TaskDir;
use crate::state_manager::StateManager;
use crate::store::StateStoreFactory;
use crate::topology::Topology;

pub mod active;
pub mod standby;

pub use active::ActiveTask;
pub use standby::StandbyTask;

/// What every task is made of.
pub struct TaskCore {
    id: TaskId,
    partitions: Vec<Partition>,
    context: ProcessorContext,
    state_mgr: StateManager,
}

impl TaskCore {
    /// Lock the task's directory under `state_root` and open its
    /// stores.
    pub fn new(
        id: TaskId,
        partitions: Vec<Partition>,
        topology: &Topology,
        factory: &dyn StateStoreFactory,
        state_root: &Path,
        kind: ContextKind,
    ) -> Result<Self> {
        let mut partitions = partitions;
        partitions.sort();
        partitions.dedup();

        let dir = TaskDir::lock(state_root, id)?;
        let mut context = ProcessorContext::new(id, dir.path(), kind, topology);
        let state_mgr = StateManager::new(dir, &partitions, topology, factory, &mut context)?;
        Ok(Self {
            id,
            partitions,
            context,
            state_mgr,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn context(&self) -> &ProcessorContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ProcessorContext {
        &mut self.context
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.state_mgr
    }

    pub fn state_manager_mut(&mut self) -> &mut StateManager {
        &mut self.state_mgr
    }

    /// Flush, checkpoint and release everything.
    pub fn close(self) -> Result<()> {
        tracing::info!("Closing task {}", self.id);
        self.state_mgr.close()
    }
}

/// Operations shared by every kind of task.
pub trait Task {
    fn core(&self) -> &TaskCore;

    fn id(&self) -> TaskId {
        self.core().id()
    }

    /// Assigned change-log partitions, sorted.
    fn partitions(&self) -> &[Partition] {
        self.core().partitions()
    }

    fn context(&self) -> &ProcessorContext {
        self.core().context()
    }

    fn state_manager(&self) -> &StateManager {
        self.core().state_manager()
    }

    /// Make progress durable.
    fn commit(&mut self) -> Result<()>;

    /// Commit and release the task's stores and directory.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}
