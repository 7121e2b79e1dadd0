//! SqliteBackend: durable StorageBackend on a single SQLite key-value table.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::traits::{Scope, StorageBackend, StorageResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    identity TEXT NOT NULL,
    tbl      TEXT NOT NULL,
    key      TEXT NOT NULL,
    value    BLOB NOT NULL,
    PRIMARY KEY (identity, tbl, key)
) WITHOUT ROWID;
";

/// `rusqlite::Connection` is `Send` but not `Sync`; the mutex makes the
/// backend shareable. Single writer per process is assumed.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE identity = ?1 AND tbl = ?2 AND key = ?3",
                params![scope.identity, scope.table.as_str(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, scope: &Scope, key: &str, value: &[u8]) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv (identity, tbl, key, value) VALUES (?1, ?2, ?3, ?4)",
            params![scope.identity, scope.table.as_str(), key, value],
        )?;
        Ok(())
    }

    fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()> {
        self.conn.lock().execute(
            "DELETE FROM kv WHERE identity = ?1 AND tbl = ?2 AND key = ?3",
            params![scope.identity, scope.table.as_str(), key],
        )?;
        Ok(())
    }

    fn keys(&self, scope: &Scope) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE identity = ?1 AND tbl = ?2 ORDER BY key")?;
        let keys = stmt
            .query_map(params![scope.identity, scope.table.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn clear(&self, scope: &Scope) -> StorageResult<()> {
        self.conn.lock().execute(
            "DELETE FROM kv WHERE identity = ?1 AND tbl = ?2",
            params![scope.identity, scope.table.as_str()],
        )?;
        Ok(())
    }

    fn scan(&self, scope: &Scope) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE identity = ?1 AND tbl = ?2 ORDER BY key",
        )?;
        let entries = stmt
            .query_map(params![scope.identity, scope.table.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::Table;

    fn setup() -> SqliteBackend {
        SqliteBackend::open_in_memory().unwrap()
    }

    #[test]
    fn put_and_get() {
        let db = setup();
        let s = Scope::new("u1", Table::Cache);
        db.put(&s, "k1", b"value").unwrap();
        assert_eq!(db.get(&s, "k1").unwrap(), Some(b"value".to_vec()));
        assert!(db.get(&s, "missing").unwrap().is_none());
    }

    #[test]
    fn put_replaces() {
        let db = setup();
        let s = Scope::new("u1", Table::Cache);
        db.put(&s, "k", b"one").unwrap();
        db.put(&s, "k", b"two").unwrap();
        assert_eq!(db.get(&s, "k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(db.keys(&s).unwrap().len(), 1);
    }

    #[test]
    fn clear_is_scoped() {
        let db = setup();
        let cache = Scope::new("u1", Table::Cache);
        let outbox = Scope::new("u1", Table::Outbox);
        let other = Scope::new("u2", Table::Cache);
        db.put(&cache, "a", b"1").unwrap();
        db.put(&outbox, "a", b"2").unwrap();
        db.put(&other, "a", b"3").unwrap();

        db.clear(&cache).unwrap();
        assert!(db.keys(&cache).unwrap().is_empty());
        assert_eq!(db.keys(&outbox).unwrap(), vec!["a"]);
        assert_eq!(db.keys(&other).unwrap(), vec!["a"]);
    }

    #[test]
    fn scan_returns_sorted_entries() {
        let db = setup();
        let s = Scope::new("u1", Table::Meta);
        db.put(&s, "b", b"2").unwrap();
        db.put(&s, "a", b"1").unwrap();
        let entries = db.scan(&s).unwrap();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite3");
        let s = Scope::new("u1", Table::Outbox);
        {
            let db = SqliteBackend::open(&path).unwrap();
            db.put(&s, "m1", b"pending").unwrap();
        }
        let db = SqliteBackend::open(&path).unwrap();
        assert_eq!(db.get(&s, "m1").unwrap(), Some(b"pending".to_vec()));
    }
}
