//! Durable record of how far each change-log partition was applied.
//!
//! The checkpoint is a K-V table from [`Partition`] to the position
//! (offset of the next record to apply) whose preceding records are
//! all durably flushed to their store. It is read once when a task is
//! built and written on every flush.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::common::setup_conn;
use crate::common::BatchIterator;
use crate::common::Cursor;
use crate::common::Writer;
use crate::errors::BoxError;
use crate::errors::Result;
use crate::errors::StandbyError;
use crate::model::Offset;
use crate::model::Partition;

/// Name of the checkpoint file within a task's state directory.
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.sqlite3";

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE offsets ( \
         updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         topic TEXT NOT NULL, \
         partition INTEGER NOT NULL CHECK (partition >= 0), \
         position INTEGER NOT NULL CHECK (position >= 0), \
         PRIMARY KEY (topic, partition) \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// One row of the checkpoint table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry(pub Partition, pub Offset);

struct CheckpointWriter<'a> {
    conn: &'a mut Connection,
}

impl Writer for CheckpointWriter<'_> {
    type Item = CheckpointEntry;

    fn write_batch(&mut self, items: Vec<Self::Item>) -> rusqlite::Result<()> {
        let txn = self.conn.transaction()?;
        for entry in items {
            tracing::trace!("Writing {entry:?}");
            let CheckpointEntry(part, position) = entry;
            // Never move a partition backwards; a checkpoint only ever
            // records more durable progress.
            txn.execute(
                "INSERT INTO offsets (topic, partition, position) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT (topic, partition) DO UPDATE \
                 SET position = MAX(position, EXCLUDED.position), \
                 updated_at = CURRENT_TIMESTAMP",
                (&part.topic, part.partition, position),
            )?;
        }
        txn.commit()
    }
}

/// Keeps a cursor so each batch is its own short query.
struct CheckpointLoader<'a> {
    conn: &'a Connection,
    batch_size: usize,
    cursor: Cursor<Partition>,
}

impl<'a> CheckpointLoader<'a> {
    fn new(conn: &'a Connection, batch_size: usize) -> Self {
        Self {
            conn,
            batch_size,
            cursor: Cursor::Uninit,
        }
    }

    fn select(
        &self,
        after: Option<&Partition>,
    ) -> rusqlite::Result<(Vec<CheckpointEntry>, Cursor<Partition>)> {
        let after_topic = after.map(|part| &part.topic);
        let after_partition = after.map(|part| part.partition);

        let batch = self
            .conn
            .prepare(
                "SELECT topic, partition, position \
                 FROM offsets \
                 WHERE ?1 IS NULL OR ?2 IS NULL OR (topic, partition) > (?1, ?2) \
                 ORDER BY topic, partition \
                 LIMIT ?3",
            )?
            .query_map((after_topic, after_partition, self.batch_size), |row| {
                Ok(CheckpointEntry(
                    Partition::new(row.get::<_, String>(0)?, row.get(1)?),
                    row.get(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let cursor = match batch.last() {
            Some(CheckpointEntry(part, _position)) => Cursor::InProgress(part.clone()),
            None => Cursor::Done,
        };
        Ok((batch, cursor))
    }
}

impl BatchIterator for CheckpointLoader<'_> {
    type Item = CheckpointEntry;

    fn next_batch(&mut self) -> rusqlite::Result<Option<Vec<Self::Item>>> {
        let (batch, next_cursor) = match &self.cursor {
            Cursor::Uninit => {
                let (batch, cursor) = self.select(None)?;
                (Some(batch), cursor)
            }
            Cursor::InProgress(part) => {
                let (batch, cursor) = self.select(Some(part))?;
                (Some(batch), cursor)
            }
            Cursor::Done => (None, Cursor::Done),
        };

        self.cursor = next_cursor;
        Ok(batch)
    }
}

/// Wrapper around the checkpoint DB of one task.
pub struct OffsetCheckpoint {
    path: PathBuf,
    conn: Connection,
}

impl OffsetCheckpoint {
    /// Open the checkpoint in a task's state directory, creating an
    /// empty one if there is none.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CHECKPOINT_FILE_NAME);
        tracing::debug!("Opening offset checkpoint at {path:?}");
        let conn = Self::connect(&path).map_err(|source| StandbyError::Checkpoint {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, conn })
    }

    fn connect(path: &Path) -> std::result::Result<Connection, BoxError> {
        let mut conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn, &get_migrations())?;
        Ok(conn)
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every checkpointed position.
    pub fn read(&self) -> Result<BTreeMap<Partition, Offset>> {
        // TODO: Do we need to futz with the batch size?
        let mut loader = CheckpointLoader::new(&self.conn, 1000);
        let entries = loader.read_all().map_err(|err| self.err(err))?;
        Ok(entries
            .into_iter()
            .map(|CheckpointEntry(part, position)| (part, position))
            .collect())
    }

    /// Record positions atomically: either every entry is written or
    /// none is.
    pub fn write(&mut self, entries: Vec<CheckpointEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let res = CheckpointWriter {
            conn: &mut self.conn,
        }
        .write_batch(entries);
        res.map_err(|err| self.err(err))
    }

    /// Remove the checkpoint file; the next task built over this
    /// directory replays from the start of the change-log.
    pub fn delete(self) -> Result<()> {
        let Self { path, conn } = self;
        drop(conn);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", path.display()));
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StandbyError::Checkpoint {
                        path: file,
                        source: err.into(),
                    })
                }
            }
        }
        Ok(())
    }

    fn err(&self, err: rusqlite::Error) -> StandbyError {
        StandbyError::Checkpoint {
            path: self.path.clone(),
            source: err.into(),
        }
    }
}

#[test]
fn read_empty() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();

    assert_eq!(checkpoint.read().unwrap(), BTreeMap::new());
}

#[test]
fn write_then_read_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    checkpoint
        .write(vec![
            CheckpointEntry(Partition::new("a", 0), 5),
            CheckpointEntry(Partition::new("a", 1), 0),
            CheckpointEntry(Partition::new("b", 0), 17),
        ])
        .unwrap();
    drop(checkpoint);

    let checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    let expected = BTreeMap::from([
        (Partition::new("a", 0), 5),
        (Partition::new("a", 1), 0),
        (Partition::new("b", 0), 17),
    ]);
    assert_eq!(checkpoint.read().unwrap(), expected);
}

#[test]
fn write_never_moves_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    let part = Partition::new("a", 0);

    checkpoint
        .write(vec![CheckpointEntry(part.clone(), 9)])
        .unwrap();
    checkpoint
        .write(vec![CheckpointEntry(part.clone(), 4)])
        .unwrap();

    assert_eq!(checkpoint.read().unwrap(), BTreeMap::from([(part, 9)]));
}

#[test]
fn loader_paginates() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    let entries: Vec<_> = (0..7)
        .map(|i| CheckpointEntry(Partition::new("t", i), u64::from(i) * 10))
        .collect();
    checkpoint.write(entries.clone()).unwrap();

    let mut loader = CheckpointLoader::new(&checkpoint.conn, 3);
    let mut sizes = Vec::new();
    let mut found = Vec::new();
    while let Some(mut batch) = loader.next_batch().unwrap() {
        sizes.push(batch.len());
        found.append(&mut batch);
    }

    assert_eq!(sizes, vec![3, 3, 1, 0]);
    assert_eq!(found, entries);
}

#[test]
fn delete_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    checkpoint
        .write(vec![CheckpointEntry(Partition::new("a", 0), 5)])
        .unwrap();
    let path = checkpoint.path().to_path_buf();

    checkpoint.delete().unwrap();

    assert!(!path.exists());
    let checkpoint = OffsetCheckpoint::open(dir.path()).unwrap();
    assert!(checkpoint.read().unwrap().is_empty());
}
