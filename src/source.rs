//! The log transport, as seen from a task.
//!
//! Two capabilities are needed: reading change-log partitions
//! ([`ChangelogSource`]) and asking where the active group has
//! committed ([`CommittedOffsets`]). Both take `&self` so a single
//! transport client can be shared by the runner and every task.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::errors::BoxError;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::Offset;
use crate::model::Partition;
use crate::model::Record;

/// Reads change-log partitions.
///
/// Every partition has its own read position, moved by
/// [`Self::seek`] and advanced past every record [`Self::poll`]
/// returns.
pub trait ChangelogSource {
    /// Next poll of `partition` starts at `offset`.
    fn seek(&self, partition: &Partition, offset: Offset) -> Result<(), BoxError>;

    /// Next poll of `partition` starts at its first retained record.
    fn seek_to_beginning(&self, partition: &Partition) -> Result<(), BoxError>;

    /// Up to `max_records` records in offset order. Empty when caught
    /// up.
    fn poll(&self, partition: &Partition, max_records: usize) -> Result<Vec<Record>, BoxError>;

    /// Offset the next record written to `partition` will get.
    fn end_offset(&self, partition: &Partition) -> Result<Offset, BoxError>;
}

/// Where the consumer group of the active task has committed.
pub trait CommittedOffsets {
    /// Committed position of one partition, `None` if the group never
    /// committed it.
    fn committed(&self, partition: &Partition) -> Result<Option<Offset>, BoxError>;

    /// Committed positions of many partitions at once.
    ///
    /// Either every partition is answered or the call fails as a
    /// whole. Transports with a batched lookup should override this.
    fn committed_offsets(
        &self,
        partitions: &[Partition],
    ) -> Result<BTreeMap<Partition, Option<Offset>>> {
        partitions
            .iter()
            .map(|part| {
                self.committed(part)
                    .map(|offset| (part.clone(), offset))
                    .map_err(|source| StandbyError::OffsetQuery {
                        partition: part.clone(),
                        source,
                    })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<Record>,
    /// Offset of the next record to poll.
    read_pos: Offset,
    /// Survives truncation, unlike the records.
    end: Offset,
    committed: Option<Offset>,
}

impl Log {
    fn end_offset(&self) -> Offset {
        self.end
    }

    fn push(&mut self, record: Record) {
        self.end = record.offset + 1;
        self.records.push(record);
    }
}

#[derive(Debug, Default)]
struct Inner {
    logs: BTreeMap<Partition, Log>,
    unavailable: bool,
}

/// A change-log transport entirely in memory.
///
/// Offsets of a partition start at 0 and are contiguous unless
/// records are appended with explicit offsets.
#[derive(Debug, Default)]
pub struct InMemChangelog {
    inner: Mutex<Inner>,
}

impl InMemChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // The state is a plain map; a panic while holding the lock
        // can't leave it half updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an upsert and return its offset.
    pub fn append(
        &self,
        partition: &Partition,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Offset {
        let mut inner = self.inner();
        let log = inner.logs.entry(partition.clone()).or_default();
        let offset = log.end_offset();
        log.push(Record::upsert(offset, key, value));
        offset
    }

    /// Append a tombstone and return its offset.
    pub fn append_tombstone(&self, partition: &Partition, key: impl Into<Vec<u8>>) -> Offset {
        let mut inner = self.inner();
        let log = inner.logs.entry(partition.clone()).or_default();
        let offset = log.end_offset();
        log.push(Record::tombstone(offset, key));
        offset
    }

    /// Append a record keeping its offset, which must be past the
    /// current end of the partition.
    pub fn append_record(&self, partition: &Partition, record: Record) -> Result<(), BoxError> {
        let mut inner = self.inner();
        let log = inner.logs.entry(partition.clone()).or_default();
        if record.offset < log.end_offset() {
            return Err(format!(
                "offset {} is behind the end {} of {partition}",
                record.offset,
                log.end_offset()
            )
            .into());
        }
        log.push(record);
        Ok(())
    }

    /// Commit a position for the active group.
    pub fn commit(&self, partition: &Partition, position: Offset) {
        let mut inner = self.inner();
        inner.logs.entry(partition.clone()).or_default().committed = Some(position);
    }

    /// While set, every committed-offset lookup fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner().unavailable = unavailable;
    }

    /// Drop every record before `offset`, like log retention would.
    pub fn truncate_before(&self, partition: &Partition, offset: Offset) {
        let mut inner = self.inner();
        if let Some(log) = inner.logs.get_mut(partition) {
            log.records.retain(|record| record.offset >= offset);
        }
    }
}

impl ChangelogSource for InMemChangelog {
    fn seek(&self, partition: &Partition, offset: Offset) -> Result<(), BoxError> {
        let mut inner = self.inner();
        inner.logs.entry(partition.clone()).or_default().read_pos = offset;
        Ok(())
    }

    fn seek_to_beginning(&self, partition: &Partition) -> Result<(), BoxError> {
        let mut inner = self.inner();
        let log = inner.logs.entry(partition.clone()).or_default();
        log.read_pos = log.records.first().map_or(log.end, |record| record.offset);
        Ok(())
    }

    fn poll(&self, partition: &Partition, max_records: usize) -> Result<Vec<Record>, BoxError> {
        let mut inner = self.inner();
        let Some(log) = inner.logs.get_mut(partition) else {
            return Ok(Vec::new());
        };
        let start = log
            .records
            .partition_point(|record| record.offset < log.read_pos);
        let batch: Vec<Record> = log.records[start..]
            .iter()
            .take(max_records)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            log.read_pos = last.offset + 1;
        }
        Ok(batch)
    }

    fn end_offset(&self, partition: &Partition) -> Result<Offset, BoxError> {
        Ok(self
            .inner()
            .logs
            .get(partition)
            .map_or(0, |log| log.end_offset()))
    }
}

impl CommittedOffsets for InMemChangelog {
    fn committed(&self, partition: &Partition) -> Result<Option<Offset>, BoxError> {
        let inner = self.inner();
        if inner.unavailable {
            return Err("committed offsets are unavailable".into());
        }
        Ok(inner.logs.get(partition).and_then(|log| log.committed))
    }

    fn committed_offsets(
        &self,
        partitions: &[Partition],
    ) -> Result<BTreeMap<Partition, Option<Offset>>> {
        let inner = self.inner();
        if let (true, Some(first)) = (inner.unavailable, partitions.first()) {
            return Err(StandbyError::OffsetQuery {
                partition: first.clone(),
                source: "committed offsets are unavailable".into(),
            });
        }
        Ok(partitions
            .iter()
            .map(|part| {
                let committed = inner.logs.get(part).and_then(|log| log.committed);
                (part.clone(), committed)
            })
            .collect())
    }
}

#[test]
fn poll_advances_read_position() {
    let log = InMemChangelog::new();
    let part = Partition::new("counts-changelog", 0);
    for i in 0..5u8 {
        log.append(&part, vec![i], vec![i]);
    }

    let first = log.poll(&part, 2).unwrap();
    assert_eq!(first.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
    let rest = log.poll(&part, 10).unwrap();
    assert_eq!(rest.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3, 4]);
    assert!(log.poll(&part, 10).unwrap().is_empty());
    assert_eq!(log.end_offset(&part).unwrap(), 5);

    log.seek(&part, 3).unwrap();
    let again = log.poll(&part, 10).unwrap();
    assert_eq!(again.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![3, 4]);
}

#[test]
fn seek_to_beginning_skips_truncated() {
    let log = InMemChangelog::new();
    let part = Partition::new("t", 1);
    for i in 0..4u8 {
        log.append(&part, vec![i], vec![i]);
    }
    log.truncate_before(&part, 2);

    log.seek_to_beginning(&part).unwrap();
    let batch = log.poll(&part, 10).unwrap();
    assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![2, 3]);
}

#[test]
fn poll_unknown_partition_is_empty() {
    let log = InMemChangelog::new();
    let part = Partition::new("nothing", 0);

    assert!(log.poll(&part, 10).unwrap().is_empty());
    assert_eq!(log.end_offset(&part).unwrap(), 0);
}

#[test]
fn append_record_keeps_gaps() {
    let log = InMemChangelog::new();
    let part = Partition::new("t", 0);
    log.append_record(&part, Record::upsert(4, "a", "1")).unwrap();
    log.append_record(&part, Record::tombstone(9, "a")).unwrap();

    assert!(log.append_record(&part, Record::upsert(5, "b", "2")).is_err());
    assert_eq!(log.end_offset(&part).unwrap(), 10);
    assert_eq!(log.append(&part, "c", "3"), 10);
}

#[test]
fn committed_offsets_answers_every_partition() {
    let log = InMemChangelog::new();
    let a = Partition::new("t", 0);
    let b = Partition::new("t", 1);
    log.commit(&a, 7);

    let found = log.committed_offsets(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(found, BTreeMap::from([(a.clone(), Some(7)), (b, None)]));
    assert_eq!(log.committed(&a).unwrap(), Some(7));
}

#[test]
fn unavailable_fails_lookups() {
    let log = InMemChangelog::new();
    let part = Partition::new("t", 0);
    log.commit(&part, 3);
    log.set_unavailable(true);

    assert!(log.committed(&part).is_err());
    assert!(matches!(
        log.committed_offsets(&[part.clone()]),
        Err(StandbyError::OffsetQuery { .. })
    ));

    log.set_unavailable(false);
    assert_eq!(log.committed(&part).unwrap(), Some(3));
}

/// Only answers one partition at a time, to exercise the default
/// batched lookup.
#[cfg(test)]
struct OneByOne(BTreeMap<Partition, Offset>);

#[cfg(test)]
impl CommittedOffsets for OneByOne {
    fn committed(&self, partition: &Partition) -> Result<Option<Offset>, BoxError> {
        if partition.topic == "broken" {
            return Err("no leader".into());
        }
        Ok(self.0.get(partition).copied())
    }
}

#[test]
fn default_batched_lookup_loops() {
    let a = Partition::new("t", 0);
    let b = Partition::new("t", 1);
    let source = OneByOne(BTreeMap::from([(a.clone(), 2)]));

    let found = source.committed_offsets(&[a.clone(), b.clone()]).unwrap();
    assert_eq!(found, BTreeMap::from([(a.clone(), Some(2)), (b, None)]));

    let broken = Partition::new("broken", 0);
    match source.committed_offsets(&[a, broken.clone()]) {
        Err(StandbyError::OffsetQuery { partition, .. }) => assert_eq!(partition, broken),
        other => panic!("unexpected {other:?}"),
    }
}
