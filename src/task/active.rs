//! The task that owns a partition and serves its state.
//!
//! Only the state side lives here: the record-processing pipeline
//! runs elsewhere and reads and writes the stores through the typed
//! accessors below.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use super::Task;
use super::TaskCore;
use crate::config::StandbyConfig;
use crate::context::ContextKind;
use crate::context::ProcessorContext;
use crate::errors::InitContext;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::Offset;
use crate::model::Partition;
use crate::model::TaskId;
use crate::source::ChangelogSource;
use crate::store::StateStoreFactory;
use crate::topology::Topology;

pub struct ActiveTask {
    core: TaskCore,
}

impl ActiveTask {
    /// Build an active task and bring its stores up to date with the
    /// end of their change-logs.
    #[instrument(name = "build_active_task", skip_all, fields(task = %id))]
    pub fn new(
        id: TaskId,
        partitions: Vec<Partition>,
        topology: &Topology,
        factory: &dyn StateStoreFactory,
        changelog: &dyn ChangelogSource,
        config: &StandbyConfig,
    ) -> Result<Self> {
        let mut core = TaskCore::new(
            id,
            partitions,
            topology,
            factory,
            &config.state_dir,
            ContextKind::Active,
        )?;
        for part in core.partitions().to_vec() {
            core.state_manager_mut()
                .restore(&part, changelog, config.poll_max_records)
                .init_err(id, &format!("can't restore {part}"))?;
        }
        tracing::info!("Built active task {id} over {:?}", core.partitions());
        Ok(Self { core })
    }

    pub fn context_mut(&mut self) -> &mut ProcessorContext {
        self.core.context_mut()
    }

    /// Position the stores were restored to, plus anything applied
    /// since.
    pub fn position(&self, partition: &Partition) -> Offset {
        self.core.state_manager().position(partition)
    }

    /// Has the pipeline asked for a commit since the last one?
    pub fn commit_needed(&mut self) -> bool {
        self.core.context_mut().take_commit_request()
    }

    pub fn get<K, V>(&self, store: &str, key: &K) -> Result<Option<V>>
    where
        K: Serialize,
        V: DeserializeOwned,
    {
        let (key_serde, value_serde) = self.serdes(store)?;
        let key = key_serde.ser(key).map_err(|err| store_err(store, err))?;
        let found = self
            .core
            .state_manager()
            .store(store)
            .ok_or_else(|| StandbyError::UnknownStore(store.to_string()))?
            .get(&key)
            .map_err(|err| store_err(store, err))?;
        found
            .map(|bytes| value_serde.de(&bytes))
            .transpose()
            .map_err(|err| store_err(store, err))
    }

    pub fn put<K, V>(&mut self, store: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        let (key_serde, value_serde) = self.serdes(store)?;
        let key = key_serde.ser(key).map_err(|err| store_err(store, err))?;
        let value = value_serde.ser(value).map_err(|err| store_err(store, err))?;
        self.core
            .state_manager_mut()
            .store_mut(store)
            .ok_or_else(|| StandbyError::UnknownStore(store.to_string()))?
            .put(&key, &value)
            .map_err(|err| store_err(store, err))
    }

    pub fn delete<K>(&mut self, store: &str, key: &K) -> Result<()>
    where
        K: Serialize,
    {
        let (key_serde, _value_serde) = self.serdes(store)?;
        let key = key_serde.ser(key).map_err(|err| store_err(store, err))?;
        self.core
            .state_manager_mut()
            .store_mut(store)
            .ok_or_else(|| StandbyError::UnknownStore(store.to_string()))?
            .delete(&key)
            .map_err(|err| store_err(store, err))
    }

    fn serdes(&self, store: &str) -> Result<(crate::codec::Serde, crate::codec::Serde)> {
        let context = self.core.context();
        match (context.key_serde(store), context.value_serde(store)) {
            (Some(key), Some(value)) => Ok((key, value)),
            _ => Err(StandbyError::UnknownStore(store.to_string())),
        }
    }
}

fn store_err(store: &str, source: crate::errors::BoxError) -> StandbyError {
    StandbyError::Store {
        store: store.to_string(),
        source,
    }
}

impl Task for ActiveTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    #[instrument(name = "commit_active_task", skip_all, fields(task = %self.core.id()))]
    fn commit(&mut self) -> Result<()> {
        self.core.state_manager_mut().flush()?;
        self.core.context_mut().take_commit_request();
        tracing::debug!("Committed active task {}", self.core.id());
        Ok(())
    }

    fn close(self) -> Result<()> {
        self.core.close()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::checkpoint::OffsetCheckpoint;
    use crate::codec::Serde;
    use crate::source::InMemChangelog;
    use crate::store::DefaultStoreFactory;
    use crate::topology::StoreSpec;

    fn topology() -> Topology {
        Topology::new(vec![
            StoreSpec::new("counts", "counts-changelog").with_serdes(Serde::Utf8, Serde::Json)
        ])
        .unwrap()
    }

    fn counts(partition: u32) -> Partition {
        Partition::new("counts-changelog", partition)
    }

    fn build(config: &StandbyConfig, log: &InMemChangelog) -> Result<ActiveTask> {
        ActiveTask::new(
            TaskId::new(1, 0),
            vec![counts(0)],
            &topology(),
            &DefaultStoreFactory,
            log,
            config,
        )
    }

    #[test]
    fn restores_whole_changelog_on_build() {
        let root = tempfile::tempdir().unwrap();
        let config = StandbyConfig::new(root.path());
        let log = InMemChangelog::new();
        log.append(&counts(0), "apples", "3");
        log.append(&counts(0), "pears", "1");
        log.append(&counts(0), "apples", "4");
        log.append_tombstone(&counts(0), "pears");

        let task = build(&config, &log).unwrap();

        assert_eq!(task.position(&counts(0)), 4);
        assert_eq!(
            task.get::<String, u64>("counts", &"apples".to_string()).unwrap(),
            Some(4)
        );
        assert_eq!(
            task.get::<String, u64>("counts", &"pears".to_string()).unwrap(),
            None
        );
    }

    #[test]
    fn typed_access_round_trips() {
        let root = tempfile::tempdir().unwrap();
        let config = StandbyConfig::new(root.path());
        let log = InMemChangelog::new();
        let mut task = build(&config, &log).unwrap();
        let key = "plums".to_string();

        task.put("counts", &key, &7u64).unwrap();
        assert_eq!(task.get::<_, u64>("counts", &key).unwrap(), Some(7));
        task.delete("counts", &key).unwrap();
        assert_eq!(task.get::<_, u64>("counts", &key).unwrap(), None);

        assert!(matches!(
            task.put("nope", &key, &1u64),
            Err(StandbyError::UnknownStore(name)) if name == "nope"
        ));
    }

    #[test]
    fn commit_requests_are_cleared_by_commit() {
        let root = tempfile::tempdir().unwrap();
        let config = StandbyConfig::new(root.path());
        let log = InMemChangelog::new();
        log.append(&counts(0), "apples", "1");
        let mut task = build(&config, &log).unwrap();

        task.context_mut().request_commit().unwrap();
        task.commit().unwrap();

        assert!(!task.commit_needed());
        let checkpoint = OffsetCheckpoint::open(&root.path().join("1_0")).unwrap();
        assert_eq!(
            checkpoint.read().unwrap(),
            BTreeMap::from([(counts(0), 1)])
        );
    }

    #[test]
    fn rebuild_restores_only_the_tail() {
        let root = tempfile::tempdir().unwrap();
        let config = StandbyConfig::new(root.path());
        let log = InMemChangelog::new();
        log.append(&counts(0), "apples", "1");
        log.append(&counts(0), "pears", "2");
        build(&config, &log).unwrap().close().unwrap();

        // Records before the checkpoint are gone; a full replay would
        // lose "apples".
        log.truncate_before(&counts(0), 2);
        log.append(&counts(0), "plums", "3");
        let task = build(&config, &log).unwrap();

        assert_eq!(task.position(&counts(0)), 3);
        assert_eq!(
            task.get::<String, u64>("counts", &"apples".to_string()).unwrap(),
            Some(1)
        );
        assert_eq!(
            task.get::<String, u64>("counts", &"plums".to_string()).unwrap(),
            Some(3)
        );
    }
}
