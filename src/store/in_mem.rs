//! Implementation of an in-memory state store.
//!
//! Nothing survives a restart, so a task using it replays the whole
//! change-log on start. Flushing is a no-op.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use seahash::SeaHasher;

use super::StateStore;
use crate::errors::BoxError;

/// A state store with all data in memory.
#[derive(Debug)]
pub struct InMemStore {
    name: String,
    db: HashMap<Vec<u8>, Vec<u8>, BuildHasherDefault<SeaHasher>>,
}

impl InMemStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            db: HashMap::default(),
        }
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries: Vec<_> = self
            .db
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort();
        entries
    }
}

impl StateStore for InMemStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn persistent(&self) -> bool {
        false
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BoxError> {
        self.db.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), BoxError> {
        self.db.remove(key);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BoxError> {
        Ok(self.db.get(key).cloned())
    }

    fn flush(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        self.db.clear();
        Ok(())
    }

    fn approximate_len(&self) -> Result<usize, BoxError> {
        Ok(self.db.len())
    }
}

#[test]
fn put_overwrites() {
    let mut store = InMemStore::new("counts");

    store.put(b"a", b"x").unwrap();
    store.put(b"a", b"y").unwrap();
    store.put(b"b", b"z").unwrap();

    let expected = vec![
        (b"a".to_vec(), b"y".to_vec()),
        (b"b".to_vec(), b"z".to_vec()),
    ];
    assert_eq!(store.entries(), expected);
    assert_eq!(store.approximate_len().unwrap(), 2);
}

#[test]
fn delete_drops_key() {
    let mut store = InMemStore::new("counts");

    store.put(b"a", b"x").unwrap();
    store.delete(b"a").unwrap();
    // Deleting again is fine.
    store.delete(b"a").unwrap();

    assert_eq!(store.get(b"a").unwrap(), None);
    assert!(store.entries().is_empty());
}
