//! Local key-value state stores.
//!
//! A store is the authoritative replica of one logical piece of
//! application state. Its on-disk format is its own business: the
//! state manager only needs the operations of [`StateStore`].
//!
//! There are 2 implementations: [`sqlite::SqliteStore`] for stores
//! that must survive a restart and [`in_mem::InMemStore`] for ones
//! that are rebuilt from their change-log every time.

use crate::context::ProcessorContext;
use crate::errors::BoxError;
use crate::topology::StoreSpec;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::InMemStore;
pub use sqlite::SqliteStore;

/// A partitioned key to value mapping.
pub trait StateStore: Send {
    fn name(&self) -> &str;

    /// Will writes survive a process restart after [`Self::flush`]?
    fn persistent(&self) -> bool;

    /// Insert or overwrite the value of a key.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BoxError>;

    /// Remove a key. Deleting a missing key is not an error.
    fn delete(&mut self, key: &[u8]) -> Result<(), BoxError>;

    /// Read a key, including writes not yet flushed.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BoxError>;

    /// Make every write so far durable.
    ///
    /// Once this returns `Ok`, the writes must be readable after a
    /// crash. On `Err` nothing can be assumed about the unflushed
    /// writes.
    fn flush(&mut self) -> Result<(), BoxError>;

    /// Release resources. Unflushed writes may be lost.
    fn close(&mut self) -> Result<(), BoxError>;

    /// Number of keys, counting writes not yet flushed.
    fn approximate_len(&self) -> Result<usize, BoxError>;
}

/// Opens the stores a topology asks for.
pub trait StateStoreFactory {
    fn open(
        &self,
        spec: &StoreSpec,
        context: &ProcessorContext,
    ) -> Result<Box<dyn StateStore>, BoxError>;
}

/// Persistent stores go to a SQLite file named after the store in the
/// task's state directory; the others are kept in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStoreFactory;

impl StateStoreFactory for DefaultStoreFactory {
    fn open(
        &self,
        spec: &StoreSpec,
        context: &ProcessorContext,
    ) -> Result<Box<dyn StateStore>, BoxError> {
        if spec.persistent {
            let path = context.state_dir().join(format!("{}.sqlite3", spec.name));
            Ok(Box::new(SqliteStore::open(&spec.name, &path)?))
        } else {
            Ok(Box::new(InMemStore::new(&spec.name)))
        }
    }
}

/// A store which fails on demand, for exercising error paths.
#[cfg(test)]
pub(crate) mod faulty {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    /// Switches shared between a test and the stores it made.
    #[derive(Debug, Default)]
    pub(crate) struct Faults {
        pub(crate) fail_flush: AtomicBool,
        /// Fail flushes of the store with this name only.
        pub(crate) fail_flush_store: Mutex<Option<String>>,
        pub(crate) fail_put_key: Mutex<Option<Vec<u8>>>,
        pub(crate) fail_open: AtomicBool,
    }

    pub(crate) struct FaultyStore {
        inner: InMemStore,
        faults: Arc<Faults>,
        /// Everything visible at the last successful flush.
        pub(crate) flushed: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
    }

    impl StateStore for FaultyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn persistent(&self) -> bool {
            true
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BoxError> {
            if self.faults.fail_put_key.lock().unwrap().as_deref() == Some(key) {
                return Err("injected put failure".into());
            }
            self.inner.put(key, value)
        }

        fn delete(&mut self, key: &[u8]) -> Result<(), BoxError> {
            self.inner.delete(key)
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BoxError> {
            self.inner.get(key)
        }

        fn flush(&mut self) -> Result<(), BoxError> {
            let named = self.faults.fail_flush_store.lock().unwrap().as_deref()
                == Some(self.name());
            if named || self.faults.fail_flush.load(Ordering::SeqCst) {
                return Err("injected flush failure".into());
            }
            *self.flushed.lock().unwrap() = self.inner.entries();
            Ok(())
        }

        fn close(&mut self) -> Result<(), BoxError> {
            Ok(())
        }

        fn approximate_len(&self) -> Result<usize, BoxError> {
            self.inner.approximate_len()
        }
    }

    /// Makes [`FaultyStore`]s sharing one set of switches.
    #[derive(Default)]
    pub(crate) struct FaultyFactory {
        pub(crate) faults: Arc<Faults>,
        pub(crate) flushed: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>,
    }

    impl StateStoreFactory for FaultyFactory {
        fn open(
            &self,
            spec: &StoreSpec,
            _context: &ProcessorContext,
        ) -> Result<Box<dyn StateStore>, BoxError> {
            if self.faults.fail_open.load(Ordering::SeqCst) {
                return Err("injected open failure".into());
            }
            Ok(Box::new(FaultyStore {
                inner: InMemStore::new(&spec.name),
                faults: self.faults.clone(),
                flushed: self.flushed.clone(),
            }))
        }
    }
}
