use crate::backend::{Backend, BackendError};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const SCHEMA_VERSION: i64 = 1;

/// Durable backend storing one row per `(record_key, field)`.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, BackendError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| BackendError::Unavailable("sqlite connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|err| BackendError::Unavailable(format!("sqlite worker failed: {err}")))?
    }
}

fn schema_version(conn: &Connection) -> Result<i64, BackendError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), BackendError> {
    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(BackendError::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_records.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn set_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), BackendError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "
                    INSERT INTO record_fields (record_key, field, value)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(record_key, field) DO UPDATE SET value = excluded.value
                    ",
                )?;
                for (field, value) in &fields {
                    stmt.execute(params![key, field, value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT field, value FROM record_fields WHERE record_key = ?1")?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut fields = BTreeMap::new();
            for row in rows {
                let (field, value) = row?;
                fields.insert(field, value);
            }
            Ok(fields)
        })
        .await
    }

    async fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, BackendError> {
        let key = key.to_string();
        let fields = fields.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT value FROM record_fields WHERE record_key = ?1 AND field = ?2",
            )?;
            let mut values = Vec::with_capacity(fields.len());
            for field in &fields {
                let value = stmt
                    .query_row(params![key, field], |row| row.get::<_, String>(0))
                    .optional()?;
                values.push(value);
            }
            Ok(values)
        })
        .await
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<usize, BackendError> {
        let key = key.to_string();
        let fields = fields.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt =
                    tx.prepare("DELETE FROM record_fields WHERE record_key = ?1 AND field = ?2")?;
                for field in &fields {
                    removed += stmt.execute(params![key, field])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let changes =
                conn.execute("DELETE FROM record_fields WHERE record_key = ?1", params![key])?;
            Ok(changes > 0)
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, BackendError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "
                SELECT DISTINCT record_key FROM record_fields
                WHERE substr(record_key, 1, length(?1)) = ?1
                ",
            )?;
            let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
            let mut keys = BTreeSet::new();
            for row in rows {
                keys.insert(row?);
            }
            Ok(keys)
        })
        .await
    }
}
