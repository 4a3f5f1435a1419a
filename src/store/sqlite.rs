//! SQLite implementation of a durable state store.
//!
//! Writes are buffered in memory and land in the DB file in a single
//! transaction on [`StateStore::flush`]. Until then they are only
//! visible through [`StateStore::get`] on this handle, and a crash
//! loses them, which is fine: the change-log still has them and the
//! offset checkpoint was not advanced past them.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::StateStore;
use crate::common::setup_conn;
use crate::common::Writer;
use crate::errors::BoxError;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE kv ( \
         key BLOB NOT NULL PRIMARY KEY, \
         value BLOB NOT NULL \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// A change buffered until the next flush. `None` is a delete.
type Pending = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Wrapper around an SQLite DB connection holding one store.
pub struct SqliteStore {
    name: String,
    path: Option<PathBuf>,
    conn: Connection,
    pending: Pending,
}

struct KvWriter<'a> {
    conn: &'a mut Connection,
}

impl Writer for KvWriter<'_> {
    type Item = (Vec<u8>, Option<Vec<u8>>);

    fn write_batch(&mut self, items: Vec<Self::Item>) -> rusqlite::Result<()> {
        let txn = self.conn.transaction()?;
        for (key, value) in items {
            match value {
                Some(value) => {
                    txn.execute(
                        "INSERT INTO kv (key, value) \
                         VALUES (?1, ?2) \
                         ON CONFLICT (key) DO UPDATE \
                         SET value = EXCLUDED.value",
                        (&key, &value),
                    )?;
                }
                None => {
                    txn.execute("DELETE FROM kv WHERE key = ?1", (&key,))?;
                }
            }
        }
        txn.commit()
    }
}

impl SqliteStore {
    /// Open or create the store's DB file.
    pub fn open(name: &str, file: &Path) -> Result<Self, BoxError> {
        tracing::debug!("Opening store {name:?} at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn, &get_migrations())?;
        // Catch a corrupt file now rather than on the first read.
        let check: String = conn.query_row("PRAGMA quick_check", (), |row| row.get(0))?;
        if check != "ok" {
            return Err(format!("store file {file:?} failed integrity check: {check}").into());
        }

        Ok(Self {
            name: name.to_string(),
            path: Some(file.to_path_buf()),
            conn,
            pending: BTreeMap::new(),
        })
    }

    pub fn open_in_memory(name: &str) -> Result<Self, BoxError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn, &get_migrations())?;

        Ok(Self {
            name: name.to_string(),
            path: None,
            conn,
            pending: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn writer(&mut self) -> KvWriter<'_> {
        KvWriter {
            conn: &mut self.conn,
        }
    }
}

impl StateStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn persistent(&self) -> bool {
        self.path.is_some()
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BoxError> {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), BoxError> {
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BoxError> {
        if let Some(change) = self.pending.get(key) {
            return Ok(change.clone());
        }
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", (key,), |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch: Vec<_> = self
            .pending
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let count = batch.len();
        // Only forget the buffered writes once they are committed, so
        // a failed flush can be retried.
        self.writer().write_batch(batch)?;
        self.pending.clear();
        tracing::trace!("Flushed {count} writes to store {:?}", self.name);
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        if !self.pending.is_empty() {
            tracing::debug!(
                "Closing store {:?} dropping {} unflushed writes",
                self.name,
                self.pending.len()
            );
            self.pending.clear();
        }
        Ok(())
    }

    fn approximate_len(&self) -> Result<usize, BoxError> {
        let stored: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM kv", (), |row| row.get(0))?;
        let mut len = usize::try_from(stored)?;
        let mut stmt = self
            .conn
            .prepare_cached("SELECT EXISTS(SELECT 1 FROM kv WHERE key = ?1)")?;
        for (key, change) in &self.pending {
            let exists: bool = stmt.query_row((key,), |row| row.get(0))?;
            match (exists, change) {
                (false, Some(_)) => len += 1,
                (true, None) => len -= 1,
                _ => {}
            }
        }
        Ok(len)
    }
}

#[test]
fn len_counts_pending_changes_once() {
    let mut store = SqliteStore::open_in_memory("counts").unwrap();
    store.put(b"a", b"1").unwrap();
    store.put(b"b", b"2").unwrap();
    store.flush().unwrap();

    store.put(b"a", b"3").unwrap();
    store.put(b"c", b"4").unwrap();
    store.delete(b"b").unwrap();
    store.delete(b"d").unwrap();

    assert_eq!(store.approximate_len().unwrap(), 2);
    store.flush().unwrap();
    assert_eq!(store.approximate_len().unwrap(), 2);
}

#[test]
fn get_reads_through_pending() {
    let mut store = SqliteStore::open_in_memory("counts").unwrap();

    store.put(b"a", b"1").unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    store.flush().unwrap();
    assert_eq!(store.pending_len(), 0);
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

    store.delete(b"a").unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    store.flush().unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
}

#[test]
fn unflushed_writes_do_not_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("counts.sqlite3");

    let mut store = SqliteStore::open("counts", &file).unwrap();
    store.put(b"a", b"1").unwrap();
    store.flush().unwrap();
    store.put(b"b", b"2").unwrap();
    store.close().unwrap();
    drop(store);

    let store = SqliteStore::open("counts", &file).unwrap();
    assert!(store.persistent());
    assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), None);
    assert_eq!(store.approximate_len().unwrap(), 1);
}

#[test]
fn open_rejects_garbage_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("counts.sqlite3");
    std::fs::write(&file, b"this is not a database, not even close to one").unwrap();

    assert!(SqliteStore::open("counts", &file).is_err());
}
