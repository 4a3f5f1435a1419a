//! Drive a standby task against a change-log.
//!
//! This is the loop a scheduler would run for every standby task:
//! poll each partition, hand the records to the task, keep what the
//! task held back, and commit at regular system time intervals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::instrument;

use crate::config::StandbyConfig;
use crate::errors::error_chain;
use crate::errors::prepend_tname;
use crate::errors::BoxError;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::Partition;
use crate::model::Record;
use crate::source::ChangelogSource;
use crate::task::StandbyTask;
use crate::task::Task;

/// What one [`StandbyRunner::step`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepSummary {
    /// Records written into stores.
    pub applied: usize,
    /// Records held back at the offset limit, over all partitions.
    pub held: usize,
    /// Was the task committed at the end of the step?
    pub committed: bool,
}

pub struct StandbyRunner {
    task: StandbyTask,
    changelog: Arc<dyn ChangelogSource + Send + Sync>,
    /// Records at or past the offset limit, waiting for a commit to
    /// raise it.
    held: BTreeMap<Partition, Vec<Record>>,
    poll_max_records: usize,
    commit_interval: Duration,
    last_commit: Instant,
}

impl StandbyRunner {
    /// Position every partition of `task` at its checkpoint, or at
    /// the start of the change-log if it has none.
    #[instrument(name = "build_standby_runner", skip_all, fields(task = %task.id()))]
    pub fn new(
        task: StandbyTask,
        changelog: Arc<dyn ChangelogSource + Send + Sync>,
        config: &StandbyConfig,
    ) -> Result<Self> {
        for (part, position) in task.checkpointed_offsets().iter() {
            let res = match position {
                Some(position) => {
                    tracing::debug!("Seeking {part} to checkpoint {position}");
                    changelog.seek(part, position)
                }
                None => {
                    tracing::debug!("Seeking {part} to beginning");
                    changelog.seek_to_beginning(part)
                }
            };
            res.map_err(|source| changelog_err(part, source))?;
        }

        Ok(Self {
            task,
            changelog,
            held: BTreeMap::new(),
            poll_max_records: config.poll_max_records,
            commit_interval: config.commit_interval(),
            last_commit: Instant::now(),
        })
    }

    pub fn task(&self) -> &StandbyTask {
        &self.task
    }

    /// Records currently held back for a partition.
    pub fn held(&self, partition: &Partition) -> &[Record] {
        self.held.get(partition).map(Vec::as_slice).unwrap_or_default()
    }

    /// Feed every partition once, then commit if the interval is up.
    ///
    /// Held-back records of a partition are retried before polling it
    /// again, and it is not polled while any remain. If a record
    /// can't be applied, the partition is rewound to the task's
    /// position so the next step retries from there, and the error
    /// is returned.
    pub fn step(&mut self) -> Result<StepSummary> {
        let mut summary = StepSummary::default();
        let partitions = self.task.partitions().to_vec();
        for part in &partitions {
            let mut batch = self.held.remove(part).unwrap_or_default();
            if batch.is_empty() {
                batch = self
                    .changelog
                    .poll(part, self.poll_max_records)
                    .map_err(|source| changelog_err(part, source))?;
            }
            if batch.is_empty() {
                continue;
            }

            let offered = batch.len();
            match self.task.update(part, batch) {
                Ok(rest) => {
                    summary.applied += offered - rest.len();
                    if !rest.is_empty() {
                        self.held.insert(part.clone(), rest);
                    }
                }
                Err(err @ StandbyError::Apply { .. }) => {
                    let position = self.task.position(part);
                    let msg = format!("Rewinding {part} to {position} after {}", error_chain(&err));
                    tracing::warn!("{}", prepend_tname(msg));
                    self.changelog
                        .seek(part, position)
                        .map_err(|source| changelog_err(part, source))?;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        summary.held = self.held.values().map(Vec::len).sum();

        if self.last_commit.elapsed() >= self.commit_interval {
            self.commit()?;
            summary.committed = true;
        }
        tracing::trace!("Stepped task {}: {summary:?}", self.task.id());
        Ok(summary)
    }

    /// Commit the task now, whatever the interval.
    pub fn commit(&mut self) -> Result<()> {
        self.task.commit()?;
        self.last_commit = Instant::now();
        Ok(())
    }

    /// Step until a step applies nothing, then commit.
    ///
    /// Returns the total number of records applied.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut applied = 0;
        loop {
            let summary = self.step()?;
            applied += summary.applied;
            if summary.applied == 0 {
                break;
            }
        }
        self.commit()?;
        Ok(applied)
    }

    /// Flush, checkpoint and close the task.
    pub fn close(self) -> Result<()> {
        self.task.close()
    }
}

fn changelog_err(partition: &Partition, source: BoxError) -> StandbyError {
    StandbyError::Changelog {
        partition: partition.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;
    use crate::source::InMemChangelog;
    use crate::store::faulty::FaultyFactory;
    use crate::store::DefaultStoreFactory;
    use crate::store::StateStoreFactory;
    use crate::topology::StoreSpec;
    use crate::topology::Topology;

    fn counts(partition: u32) -> Partition {
        Partition::new("counts-changelog", partition)
    }

    fn runner(
        config: &StandbyConfig,
        log: &Arc<InMemChangelog>,
        factory: &dyn StateStoreFactory,
    ) -> StandbyRunner {
        let topo = Topology::new(vec![StoreSpec::new("counts", "counts-changelog")]).unwrap();
        let task = StandbyTask::new(
            TaskId::new(0, 0),
            vec![counts(0), counts(1)],
            &topo,
            factory,
            log.clone(),
            config,
        )
        .unwrap();
        StandbyRunner::new(task, log.clone(), config).unwrap()
    }

    fn config(root: &std::path::Path) -> StandbyConfig {
        StandbyConfig {
            poll_max_records: 2,
            ..StandbyConfig::new(root)
        }
    }

    #[test]
    fn holds_back_until_commit() {
        let root = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemChangelog::new());
        for i in 0..4u8 {
            log.append(&counts(0), vec![i], vec![i]);
        }
        log.commit(&counts(0), 1);
        let mut runner = runner(&config(root.path()), &log, &DefaultStoreFactory);

        let summary = runner.step().unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.held, 1);
        assert!(!summary.committed);
        assert_eq!(runner.held(&counts(0)).len(), 1);

        // Nothing new is polled while records are held.
        let summary = runner.step().unwrap();
        assert_eq!(summary.applied, 0);
        assert_eq!(summary.held, 1);

        log.commit(&counts(0), 4);
        runner.commit().unwrap();
        assert_eq!(runner.run_until_idle().unwrap(), 3);
        assert_eq!(runner.task().position(&counts(0)), 4);
        assert!(runner.held(&counts(0)).is_empty());
    }

    #[test]
    fn commits_on_interval() {
        let root = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemChangelog::new());
        let config = StandbyConfig {
            commit_interval_ms: 1,
            ..config(root.path())
        };
        let mut runner = runner(&config, &log, &DefaultStoreFactory);

        std::thread::sleep(Duration::from_millis(5));
        let summary = runner.step().unwrap();

        assert!(summary.committed);
    }

    #[test]
    fn apply_failure_rewinds_partition() {
        let root = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemChangelog::new());
        for i in 0..4u8 {
            log.append(&counts(1), vec![i], vec![i]);
        }
        log.commit(&counts(1), 4);
        let factory = FaultyFactory::default();
        *factory.faults.fail_put_key.lock().unwrap() = Some(vec![1]);
        let mut runner = runner(&config(root.path()), &log, &factory);

        assert!(matches!(
            runner.step(),
            Err(StandbyError::Apply { offset: 1, .. })
        ));
        assert_eq!(runner.task().position(&counts(1)), 1);

        *factory.faults.fail_put_key.lock().unwrap() = None;
        assert_eq!(runner.run_until_idle().unwrap(), 3);
        assert_eq!(runner.task().position(&counts(1)), 4);
        runner.close().unwrap();
    }

    #[test]
    fn restart_resumes_at_checkpoint() {
        let root = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemChangelog::new());
        for i in 0..6u8 {
            log.append(&counts(0), vec![i], vec![i]);
        }
        log.commit(&counts(0), 3);
        let mut first = runner(&config(root.path()), &log, &DefaultStoreFactory);
        assert_eq!(first.run_until_idle().unwrap(), 3);
        first.close().unwrap();

        log.commit(&counts(0), 6);
        let mut second = runner(&config(root.path()), &log, &DefaultStoreFactory);

        assert_eq!(
            second.task().checkpointed_offsets().get(&counts(0)),
            Some(3)
        );
        assert_eq!(second.run_until_idle().unwrap(), 3);
    }
}
