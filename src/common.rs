//! Small storage traits shared by the SQLite-backed components.

/// Write batches of items durably.
///
/// Each call to [`Writer::write_batch`] is one transaction: either all
/// items land or none do.
pub(crate) trait Writer {
    type Item;

    fn write_batch(&mut self, items: Vec<Self::Item>) -> rusqlite::Result<()>;
}

/// Read back items in batches, so callers don't need to keep an open
/// transaction while they consume them.
pub(crate) trait BatchIterator {
    type Item;

    /// Returns `Ok(None)` once everything was read.
    fn next_batch(&mut self) -> rusqlite::Result<Option<Vec<Self::Item>>>;

    /// Drain every remaining batch.
    fn read_all(&mut self) -> rusqlite::Result<Vec<Self::Item>> {
        let mut all = Vec::new();
        while let Some(mut batch) = self.next_batch()? {
            all.append(&mut batch);
        }
        Ok(all)
    }
}

/// Where a paginated loader is within its table.
pub(crate) enum Cursor<T> {
    /// We haven't started reading the table.
    Uninit,
    /// We should read from after position T next.
    InProgress(T),
    /// We're done reading the table.
    Done,
}

/// Setup our connection-level pragmas and bring the schema up to
/// date. Run this on each connection.
pub(crate) fn setup_conn(
    conn: &mut rusqlite::Connection,
    migrations: &rusqlite_migration::Migrations,
) -> Result<(), rusqlite_migration::Error> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations.to_latest(conn)
}
