use std::sync::Arc;

use standby_replica::codec::Serde;
use standby_replica::store::DefaultStoreFactory;
use standby_replica::{
    ActiveTask, InMemChangelog, Offset, Partition, Record, StandbyConfig, StandbyError,
    StandbyRunner, StandbyTask, StoreSpec, Task, TaskId, Topology,
};

fn topology() -> Topology {
    Topology::new(vec![
        StoreSpec::new("counts", "counts-changelog").with_serdes(Serde::Utf8, Serde::Json)
    ])
    .unwrap()
}

fn counts() -> Partition {
    Partition::new("counts-changelog", 0)
}

fn upserts(offsets: std::ops::Range<Offset>) -> Vec<Record> {
    offsets
        .map(|offset| Record::upsert(offset, format!("k{offset}"), format!("v{offset}")))
        .collect()
}

fn offsets(records: &[Record]) -> Vec<Offset> {
    records.iter().map(|record| record.offset).collect()
}

fn standby(config: &StandbyConfig, log: &Arc<InMemChangelog>) -> StandbyTask {
    StandbyTask::new(
        TaskId::new(0, 0),
        vec![counts()],
        &topology(),
        &DefaultStoreFactory,
        log.clone(),
        config,
    )
    .unwrap()
}

fn stored(task: &StandbyTask, key: &str) -> Option<Vec<u8>> {
    task.state_manager()
        .store("counts")
        .unwrap()
        .get(key.as_bytes())
        .unwrap()
}

#[test]
fn replay_follows_committed_offsets() {
    let root = tempfile::tempdir().unwrap();
    let config = StandbyConfig::new(root.path());
    let log = Arc::new(InMemChangelog::new());
    log.commit(&counts(), 3);
    let mut task = standby(&config, &log);

    let held = task.update(&counts(), upserts(0..6)).unwrap();
    assert_eq!(offsets(&held), vec![3, 4, 5]);
    assert_eq!(stored(&task, "k2"), Some(b"v2".to_vec()));
    assert_eq!(stored(&task, "k3"), None);

    // The limit is exclusive: a commit at 5 still withholds offset 5.
    log.commit(&counts(), 5);
    task.commit().unwrap();
    let held = task.update(&counts(), held).unwrap();
    assert_eq!(offsets(&held), vec![5]);

    log.commit(&counts(), 6);
    task.commit().unwrap();
    let held = task.update(&counts(), held).unwrap();
    assert!(held.is_empty());
    assert_eq!(stored(&task, "k5"), Some(b"v5".to_vec()));
    assert_eq!(task.position(&counts()), 6);
}

#[test]
fn crash_resumes_from_last_commit() {
    let root = tempfile::tempdir().unwrap();
    let config = StandbyConfig::new(root.path());
    let log = Arc::new(InMemChangelog::new());
    log.commit(&counts(), 10);
    {
        let mut task = standby(&config, &log);
        task.update(&counts(), upserts(0..5)).unwrap();
        task.commit().unwrap();
        // Applied but never committed; lost with the process.
        task.update(&counts(), upserts(5..8)).unwrap();
        std::mem::forget(task);
    }
    // The forgotten task never released its lock; pretend its
    // process is gone.
    std::fs::remove_file(root.path().join("0_0").join(".lock")).unwrap();

    let task = standby(&config, &log);

    assert_eq!(task.checkpointed_offsets().get(&counts()), Some(5));
    assert_eq!(stored(&task, "k4"), Some(b"v4".to_vec()));
    assert_eq!(stored(&task, "k6"), None);
}

#[test]
fn runner_tracks_active_writes() {
    let root = tempfile::tempdir().unwrap();
    let config = StandbyConfig {
        poll_max_records: 3,
        ..StandbyConfig::new(root.path())
    };
    let log = Arc::new(InMemChangelog::new());
    let mut runner = StandbyRunner::new(standby(&config, &log), log.clone(), &config).unwrap();

    for round in 0..3u64 {
        for i in 0..4u64 {
            let key = format!("k{i}");
            let offset = log.append(&counts(), key, (round * 10 + i).to_string());
            log.commit(&counts(), offset + 1);
        }
        runner.commit().unwrap();
        runner.run_until_idle().unwrap();
    }
    log.append_tombstone(&counts(), "k0");
    log.commit(&counts(), 13);
    runner.commit().unwrap();
    runner.run_until_idle().unwrap();

    assert_eq!(runner.task().position(&counts()), 13);
    assert_eq!(stored(runner.task(), "k0"), None);
    assert_eq!(stored(runner.task(), "k3"), Some(b"23".to_vec()));
    runner.close().unwrap();
}

#[test]
fn standby_state_matches_active_after_takeover() {
    let root = tempfile::tempdir().unwrap();
    let standby_config = StandbyConfig::new(root.path().join("standby"));
    let active_config = StandbyConfig::new(root.path().join("active"));
    let log = Arc::new(InMemChangelog::new());
    for i in 0..20u64 {
        log.append(&counts(), format!("k{}", i % 7), format!("\"{i}\""));
    }
    log.commit(&counts(), 20);

    let mut runner =
        StandbyRunner::new(standby(&standby_config, &log), log.clone(), &standby_config).unwrap();
    runner.run_until_idle().unwrap();
    runner.close().unwrap();

    let active = ActiveTask::new(
        TaskId::new(0, 0),
        vec![counts()],
        &topology(),
        &DefaultStoreFactory,
        log.as_ref(),
        &standby_config,
    )
    .unwrap();
    let fresh = ActiveTask::new(
        TaskId::new(0, 0),
        vec![counts()],
        &topology(),
        &DefaultStoreFactory,
        log.as_ref(),
        &active_config,
    )
    .unwrap();

    for i in 0..7u64 {
        let key = format!("k{i}");
        let found: Option<String> = active.get("counts", &key).unwrap();
        assert!(found.is_some());
        assert_eq!(found, fresh.get::<_, String>("counts", &key).unwrap());
    }
    assert_eq!(active.position(&counts()), 20);
}

#[test]
fn unreachable_committed_offsets_fail_construction() {
    let root = tempfile::tempdir().unwrap();
    let config = StandbyConfig::new(root.path());
    let log = Arc::new(InMemChangelog::new());
    log.set_unavailable(true);

    let res = StandbyTask::new(
        TaskId::new(0, 0),
        vec![counts()],
        &topology(),
        &DefaultStoreFactory,
        log.clone(),
        &config,
    );

    let err = res.err().unwrap();
    assert!(matches!(err, StandbyError::Initialization { .. }));
    assert!(err.is_fatal());
}
