use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("failed to create key-value directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key-value store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Hash-style key-value store: each key maps to a set of string fields.
pub trait KeyValueStore: Send + Sync {
    /// Write fields under `key`, merging with fields already there.
    fn put_hash(&self, key: &str, fields: &[(&str, String)]) -> Result<(), KvError>;

    fn get_hash(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, KvError>;

    /// Keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Remove every key starting with `prefix`. Returns the number of keys removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError>;
}

/// SQLite-backed hash store.
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    pub fn open(db_path: &Path) -> Result<Self, KvError> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| KvError::CreateDir {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;

             CREATE TABLE IF NOT EXISTS kv_hash (
                key    TEXT NOT NULL,
                field  TEXT NOT NULL,
                value  TEXT NOT NULL,
                PRIMARY KEY (key, field)
             );",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn put_hash(&self, key: &str, fields: &[(&str, String)]) -> Result<(), KvError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
            )?;
            for (field, value) in fields {
                stmt.execute(params![key, field, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_hash(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, KvError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT field, value FROM kv_hash WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = BTreeMap::new();
        for row in rows {
            let (field, value) = row?;
            map.insert(field, value);
        }
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT key FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError> {
        let conn = self.conn.lock();
        let removed = conn.query_row(
            "SELECT COUNT(DISTINCT key) FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
            |row| row.get::<_, i64>(0),
        )?;
        conn.execute(
            "DELETE FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(removed as usize)
    }
}
