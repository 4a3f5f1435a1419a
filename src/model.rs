//! Data model shared by all components.
//!
//! A change-log is a partitioned, offset-addressed log of key
//! mutations. Everything here is plain data: it can be logged,
//! compared and serialized.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A position in a single change-log partition.
///
/// When used as a "position" it is the offset of the next record to
/// read, so it is one past the last record applied.
pub type Offset = u64;

/// A shard of a change-log topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub topic: String,
    pub partition: u32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Identifies a task instance.
///
/// Stable across rebalances that hand the same partitions to the same
/// node, so it is safe to name on-disk state after it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub topic_group: u32,
    pub partition: u32,
}

impl TaskId {
    pub fn new(topic_group: u32, partition: u32) -> Self {
        Self {
            topic_group,
            partition,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.topic_group, self.partition)
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, partition) = s
            .split_once('_')
            .ok_or_else(|| format!("task id {s:?} is not of the form <group>_<partition>"))?;
        let topic_group = group
            .parse()
            .map_err(|err| format!("bad topic group in task id {s:?}: {err}"))?;
        let partition = partition
            .parse()
            .map_err(|err| format!("bad partition in task id {s:?}: {err}"))?;
        Ok(Self::new(topic_group, partition))
    }
}

/// A single record of a change-log partition.
///
/// A record without a value is a tombstone: the key was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub offset: Offset,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn upsert(offset: Offset, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn tombstone(offset: Offset, key: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            key: key.into(),
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[test]
fn task_id_round_trips_through_display() {
    let id = TaskId::new(3, 14);
    assert_eq!(id.to_string(), "3_14");
    assert_eq!("3_14".parse::<TaskId>(), Ok(id));
}

#[test]
fn task_id_rejects_garbage() {
    assert!("3-14".parse::<TaskId>().is_err());
    assert!("x_1".parse::<TaskId>().is_err());
    assert!("1_".parse::<TaskId>().is_err());
}

#[test]
fn partition_orders_by_topic_then_number() {
    let mut parts = vec![
        Partition::new("b", 0),
        Partition::new("a", 2),
        Partition::new("a", 1),
    ];
    parts.sort();
    assert_eq!(
        parts,
        vec![
            Partition::new("a", 1),
            Partition::new("a", 2),
            Partition::new("b", 0)
        ]
    );
    assert_eq!(Partition::new("counts-changelog", 7).to_string(), "counts-changelog-7");
}

#[test]
fn partition_serde_tokens() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &Partition::new("t", 1),
        &[
            Token::Struct {
                name: "Partition",
                len: 2,
            },
            Token::Str("topic"),
            Token::Str("t"),
            Token::Str("partition"),
            Token::U32(1),
            Token::StructEnd,
        ],
    );
}

#[test]
fn tombstone_has_no_value() {
    assert!(Record::tombstone(4, "k").is_tombstone());
    assert!(!Record::upsert(4, "k", "v").is_tombstone());
}
