//! Owner of a task's stores and of their replication progress.
//!
//! For every assigned change-log partition the manager tracks:
//!
//! - The store the partition writes into. Every partition of a
//!   store's change-log topic binds to that one store.
//!
//! - The offset limit: an exclusive upper bound on the offsets that
//!   may be applied. It is 0 until set, so nothing applies before the
//!   first committed-offset lookup.
//!
//! - The position: one past the last applied record. It starts at the
//!   checkpointed position and only moves forward.
//!
//! Positions become durable in the [`OffsetCheckpoint`] only after the
//! store holding their records has flushed, so a crash never resumes
//! past data that was lost.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::instrument;

use crate::checkpoint::CheckpointEntry;
use crate::checkpoint::OffsetCheckpoint;
use crate::context::ProcessorContext;
use crate::errors::error_chain;
use crate::errors::BoxError;
use crate::errors::InitContext;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::Offset;
use crate::model::Partition;
use crate::model::Record;
use crate::model::TaskId;
use crate::source::ChangelogSource;
use crate::state_dir::TaskDir;
use crate::store::StateStore;
use crate::store::StateStoreFactory;
use crate::topology::Topology;

/// Checkpointed positions as they were when a task was built.
///
/// Every assigned partition is present; a partition that was never
/// checkpointed maps to `None`. This is a value: later flushes do not
/// show up in it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointSnapshot(Arc<BTreeMap<Partition, Option<Offset>>>);

impl CheckpointSnapshot {
    pub fn new(positions: BTreeMap<Partition, Option<Offset>>) -> Self {
        Self(Arc::new(positions))
    }

    /// Checkpointed position of a partition, if there is one.
    pub fn get(&self, partition: &Partition) -> Option<Offset> {
        self.0.get(partition).copied().flatten()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.0.contains_key(partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Partition, Option<Offset>)> {
        self.0.iter().map(|(part, position)| (part, *position))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct StateManager {
    task: TaskId,
    stores: Vec<Box<dyn StateStore>>,
    /// Partition to index in `stores`.
    bindings: BTreeMap<Partition, usize>,
    offset_limits: BTreeMap<Partition, Offset>,
    positions: BTreeMap<Partition, Offset>,
    snapshot: CheckpointSnapshot,
    checkpoint: OffsetCheckpoint,
    // Dropped last, so the lock outlives every open file.
    dir: TaskDir,
}

impl StateManager {
    /// Open the stores of `partitions` and load their checkpoint.
    ///
    /// `context` must point at `dir`. It is marked initialized once
    /// every store is open.
    #[instrument(name = "build_state_manager", skip_all, fields(task = %dir.task()))]
    pub fn new(
        dir: TaskDir,
        partitions: &[Partition],
        topology: &Topology,
        factory: &dyn StateStoreFactory,
        context: &mut ProcessorContext,
    ) -> Result<Self> {
        let task = dir.task();
        let specs = topology.bind(partitions).map_err(|part| {
            StandbyError::init(task, format!("partition {part} has no store in the topology"))
        })?;

        let mut stores: Vec<Box<dyn StateStore>> = Vec::new();
        let mut bindings = BTreeMap::new();
        for (part, spec) in specs {
            let idx = match stores.iter().position(|store| store.name() == spec.name) {
                Some(idx) => idx,
                None => {
                    context.register(&spec.name)?;
                    let store = factory
                        .open(spec, context)
                        .init_err(task, &format!("can't open store {:?}", spec.name))?;
                    tracing::debug!("Opened store {:?} for task {task}", spec.name);
                    stores.push(store);
                    stores.len() - 1
                }
            };
            bindings.insert(part, idx);
        }
        context.initialized();

        let checkpoint =
            OffsetCheckpoint::open(dir.path()).init_err(task, "can't open offset checkpoint")?;
        let mut stored = checkpoint
            .read()
            .init_err(task, "can't read offset checkpoint")?;

        let mut positions = BTreeMap::new();
        let mut snapshot = BTreeMap::new();
        for (part, idx) in &bindings {
            let store = &stores[*idx];
            let position = match stored.remove(part) {
                Some(position) if store.persistent() => Some(position),
                Some(position) => {
                    tracing::debug!(
                        "Ignoring checkpoint {position} of {part}; store {:?} is not persistent",
                        store.name()
                    );
                    None
                }
                None => None,
            };
            positions.insert(part.clone(), position.unwrap_or(0));
            snapshot.insert(part.clone(), position);
        }
        for part in stored.keys() {
            tracing::debug!("Ignoring checkpoint of unassigned partition {part}");
        }
        tracing::info!("Task {task} resumes from checkpoint {snapshot:?}");

        Ok(Self {
            task,
            stores,
            bindings,
            offset_limits: BTreeMap::new(),
            positions,
            snapshot: CheckpointSnapshot::new(snapshot),
            checkpoint,
            dir,
        })
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Assigned change-log partitions, in order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.bindings.keys()
    }

    /// The checkpoint as read when this manager was built.
    pub fn checkpointed_offsets(&self) -> CheckpointSnapshot {
        self.snapshot.clone()
    }

    /// Exclusive upper bound on offsets applied to a partition.
    pub fn offset_limit(&self, partition: &Partition) -> Offset {
        self.offset_limits.get(partition).copied().unwrap_or(0)
    }

    /// Bound the offsets later updates of `partition` may apply.
    pub fn put_offset_limit(&mut self, partition: &Partition, limit: Offset) -> Result<()> {
        if !self.bindings.contains_key(partition) {
            return Err(StandbyError::UnassignedPartition(partition.clone()));
        }
        tracing::debug!("Offset limit of {partition} is now {limit}");
        self.offset_limits.insert(partition.clone(), limit);
        Ok(())
    }

    /// One past the last record applied to a partition.
    pub fn position(&self, partition: &Partition) -> Offset {
        self.positions.get(partition).copied().unwrap_or(0)
    }

    pub fn store(&self, name: &str) -> Option<&dyn StateStore> {
        self.stores
            .iter()
            .find(|store| store.name() == name)
            .map(|store| &**store)
    }

    pub fn store_mut(&mut self, name: &str) -> Option<&mut (dyn StateStore + 'static)> {
        self.stores
            .iter_mut()
            .find(|store| store.name() == name)
            .map(|store| &mut **store)
    }

    /// Apply the records of `partition` below its offset limit.
    ///
    /// Records must come in offset order. Applying stops at the first
    /// record at or past the limit; it and every record after it are
    /// returned untouched, in order. Nothing is flushed.
    pub fn update_standby_states(
        &mut self,
        partition: &Partition,
        records: Vec<Record>,
    ) -> Result<Vec<Record>> {
        let limit = self.offset_limit(partition);
        self.apply(partition, records, limit)
    }

    fn apply(
        &mut self,
        partition: &Partition,
        mut records: Vec<Record>,
        limit: Offset,
    ) -> Result<Vec<Record>> {
        let idx = *self
            .bindings
            .get(partition)
            .ok_or_else(|| StandbyError::UnassignedPartition(partition.clone()))?;
        let split = records
            .iter()
            .position(|record| record.offset >= limit)
            .unwrap_or(records.len());
        let remainder = records.split_off(split);

        let store = &mut self.stores[idx];
        let position = self.positions.entry(partition.clone()).or_insert(0);
        let count = records.len();
        for record in records {
            let res = match &record.value {
                Some(value) => store.put(&record.key, value),
                None => store.delete(&record.key),
            };
            if let Err(source) = res {
                tracing::warn!(
                    "Applying offset {} of {partition} to store {:?} failed; \
                     position stays at {position}",
                    record.offset,
                    store.name()
                );
                return Err(StandbyError::Apply {
                    partition: partition.clone(),
                    offset: record.offset,
                    source,
                });
            }
            *position = (*position).max(record.offset + 1);
        }
        tracing::trace!(
            "Applied {count} records to {partition}, holding back {} at limit {limit}",
            remainder.len()
        );
        Ok(remainder)
    }

    /// Flush every store and checkpoint the partitions they back.
    ///
    /// A partition is only checkpointed if its store flushed. If any
    /// store fails, the others are still flushed and checkpointed and
    /// the first store failure is returned, even if writing the
    /// checkpoint failed too.
    #[instrument(name = "flush_state", skip_all, fields(task = %self.task))]
    pub fn flush(&mut self) -> Result<()> {
        let mut first_err = None;
        let mut flushed = BTreeSet::new();
        for (idx, store) in self.stores.iter_mut().enumerate() {
            match store.flush() {
                Ok(()) => {
                    flushed.insert(idx);
                }
                Err(source) => {
                    tracing::warn!("Flushing store {:?} failed: {source}", store.name());
                    if first_err.is_none() {
                        first_err = Some(StandbyError::Flush {
                            store: store.name().to_string(),
                            source,
                        });
                    }
                }
            }
        }

        let entries: Vec<CheckpointEntry> = self
            .bindings
            .iter()
            .filter(|(_part, idx)| flushed.contains(*idx) && self.stores[**idx].persistent())
            .map(|(part, _idx)| CheckpointEntry(part.clone(), self.position(part)))
            .collect();
        tracing::debug!("Checkpointing {entries:?}");
        let written = self.checkpoint.write(entries);

        match (first_err, written) {
            (Some(err), Ok(())) => Err(err),
            (Some(err), Err(dropped)) => {
                tracing::warn!("Checkpoint not written either: {}", error_chain(&dropped));
                Err(err)
            }
            (None, written) => written,
        }
    }

    /// Replay a partition from its position to the current end of the
    /// change-log, ignoring the offset limit.
    ///
    /// Returns the position reached.
    #[instrument(name = "restore_partition", skip_all, fields(%partition))]
    pub fn restore(
        &mut self,
        partition: &Partition,
        changelog: &dyn ChangelogSource,
        max_records: usize,
    ) -> Result<Offset> {
        let changelog_err = |source: BoxError| StandbyError::Changelog {
            partition: partition.clone(),
            source,
        };
        if !self.bindings.contains_key(partition) {
            return Err(StandbyError::UnassignedPartition(partition.clone()));
        }
        let seeked = match self.snapshot.get(partition) {
            Some(position) => changelog.seek(partition, position),
            None => changelog.seek_to_beginning(partition),
        };
        seeked.map_err(changelog_err)?;
        let end = changelog.end_offset(partition).map_err(changelog_err)?;

        let mut count = 0;
        while self.position(partition) < end {
            let batch = changelog
                .poll(partition, max_records)
                .map_err(changelog_err)?;
            if batch.is_empty() {
                break;
            }
            count += batch.len();
            self.apply(partition, batch, Offset::MAX)?;
        }
        let position = self.position(partition);
        tracing::info!("Restored {count} records of {partition} up to {position}");
        Ok(position)
    }

    /// Flush, checkpoint and close every store, then release the
    /// state directory.
    #[instrument(name = "close_state", skip_all, fields(task = %self.task))]
    pub fn close(mut self) -> Result<()> {
        let mut res = self.flush();
        for store in &mut self.stores {
            if let Err(source) = store.close() {
                tracing::warn!("Closing store {:?} failed: {source}", store.name());
                if res.is_ok() {
                    res = Err(StandbyError::Store {
                        store: store.name().to_string(),
                        source,
                    });
                }
            }
        }
        tracing::info!("Closed state of task {} at {:?}", self.task, self.dir.path());
        res
    }
}
