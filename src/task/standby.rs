//! Warm replica of another node's task state.
//!
//! A standby task never runs user logic. It only replays the
//! change-logs of its stores, and never past what the active task's
//! consumer group has committed: the active side may still abort
//! anything beyond that.

use std::sync::Arc;

use tracing::instrument;

use super::Task;
use super::TaskCore;
use crate::config::StandbyConfig;
use crate::context::ContextKind;
use crate::errors::InitContext;
use crate::errors::Result;
use crate::model::Offset;
use crate::model::Partition;
use crate::model::Record;
use crate::model::TaskId;
use crate::source::CommittedOffsets;
use crate::state_manager::CheckpointSnapshot;
use crate::store::StateStoreFactory;
use crate::topology::Topology;

pub struct StandbyTask {
    core: TaskCore,
    committed: Arc<dyn CommittedOffsets + Send + Sync>,
    checkpointed: CheckpointSnapshot,
}

impl StandbyTask {
    /// Build a standby task over `partitions`.
    ///
    /// Opens the stores in the task's directory under
    /// [`StandbyConfig::state_dir`], captures the checkpoint and looks
    /// up the first offset limits. Any failure is an
    /// [`crate::StandbyError::Initialization`].
    #[instrument(name = "build_standby_task", skip_all, fields(task = %id))]
    pub fn new(
        id: TaskId,
        partitions: Vec<Partition>,
        topology: &Topology,
        factory: &dyn StateStoreFactory,
        committed: Arc<dyn CommittedOffsets + Send + Sync>,
        config: &StandbyConfig,
    ) -> Result<Self> {
        let core = TaskCore::new(
            id,
            partitions,
            topology,
            factory,
            &config.state_dir,
            ContextKind::Standby,
        )?;
        let checkpointed = core.state_manager().checkpointed_offsets();
        let mut task = Self {
            core,
            committed,
            checkpointed,
        };
        task.initialize_offset_limits()
            .init_err(id, "can't look up committed offsets")?;
        tracing::info!(
            "Built standby task {id} over {:?}",
            task.core.partitions()
        );
        Ok(task)
    }

    /// Checkpointed positions as of construction.
    pub fn checkpointed_offsets(&self) -> CheckpointSnapshot {
        self.checkpointed.clone()
    }

    /// The change-log partitions this task replays.
    pub fn change_log_partitions(&self) -> impl Iterator<Item = &Partition> {
        self.checkpointed.partitions()
    }

    /// Apply the records of one partition up to its offset limit.
    ///
    /// Returns the records that were not applied because they are at
    /// or past the limit, in their original order. Hand them back
    /// after the next [`Task::commit`].
    pub fn update(&mut self, partition: &Partition, records: Vec<Record>) -> Result<Vec<Record>> {
        self.core
            .state_manager_mut()
            .update_standby_states(partition, records)
    }

    /// Re-read the active group's committed offsets into the offset
    /// limits.
    ///
    /// Either every limit is replaced or, if the lookup fails, none
    /// is.
    pub fn initialize_offset_limits(&mut self) -> Result<()> {
        let partitions = self.core.partitions().to_vec();
        let committed = self.committed.committed_offsets(&partitions)?;

        let state_mgr = self.core.state_manager_mut();
        for part in &partitions {
            let limit = committed.get(part).copied().flatten().unwrap_or(0);
            let previous = state_mgr.offset_limit(part);
            if limit < previous {
                tracing::warn!(
                    "Committed offset of {part} went back from {previous} to {limit}; \
                     using it as is"
                );
            }
            state_mgr.put_offset_limit(part, limit)?;
        }
        Ok(())
    }

    pub fn offset_limit(&self, partition: &Partition) -> Offset {
        self.core.state_manager().offset_limit(partition)
    }

    /// One past the last record applied to a partition.
    pub fn position(&self, partition: &Partition) -> Offset {
        self.core.state_manager().position(partition)
    }
}

impl Task for StandbyTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    /// Flush the stores, checkpoint, then refresh the offset limits.
    #[instrument(name = "commit_standby_task", skip_all, fields(task = %self.core.id()))]
    fn commit(&mut self) -> Result<()> {
        self.core.state_manager_mut().flush()?;
        self.initialize_offset_limits()?;
        tracing::debug!("Committed standby task {}", self.core.id());
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.core.close()
    }
}
