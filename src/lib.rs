//! Standby replicas of partitioned task state.
//!
//! A stateful partition of a stream processing job is owned by one
//! active task. Standby tasks on other nodes keep a warm copy of its
//! stores by replaying their change-log partitions, never past the
//! offset the active task's consumer group has committed. If the
//! active task dies, a standby can take over after replaying only
//! the tail of the change-log.
//!
//! The pieces, leaves first:
//!
//! - [`store::StateStore`]: a local key-value store.
//!
//! - [`checkpoint::OffsetCheckpoint`]: the durable position of every
//!   change-log partition of a task.
//!
//! - [`StateManager`]: applies change-log records to stores within
//!   per-partition offset limits and checkpoints what was flushed.
//!
//! - [`StandbyTask`]: a state manager plus the committed-offset view
//!   that bounds it. [`ActiveTask`] shares its state machinery but
//!   restores eagerly and serves reads and writes.
//!
//! - [`StandbyRunner`]: polls a [`ChangelogSource`] and drives a
//!   standby task, committing at regular intervals.
//!
//! Replay is at-least-once and idempotent by key; a crash resumes
//! from the last checkpoint.

pub mod checkpoint;
pub mod codec;
pub(crate) mod common;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod model;
pub mod runner;
pub mod source;
pub mod state_dir;
pub mod state_manager;
pub mod store;
pub mod task;
pub mod topology;

pub use config::StandbyConfig;
pub use errors::Result;
pub use errors::StandbyError;
pub use model::Offset;
pub use model::Partition;
pub use model::Record;
pub use model::TaskId;
pub use runner::StandbyRunner;
pub use source::ChangelogSource;
pub use source::CommittedOffsets;
pub use source::InMemChangelog;
pub use state_manager::CheckpointSnapshot;
pub use state_manager::StateManager;
pub use task::ActiveTask;
pub use task::StandbyTask;
pub use task::Task;
pub use topology::StoreSpec;
pub use topology::Topology;
