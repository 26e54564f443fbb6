use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Hash-per-key field storage. Reads of absent records come back empty and
/// deletes of absent data report that nothing changed. A record whose last
/// field is deleted no longer exists.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Writes all fields or none of them.
    async fn set_fields(&self, key: &str, fields: Vec<(String, String)>)
        -> Result<(), BackendError>;

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError>;

    /// Values in the order requested, `None` for missing fields.
    async fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, BackendError>;

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<usize, BackendError>;

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError>;

    async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, BackendError>;
}

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn set_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), BackendError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut records = self.records.write().await;
        records.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn get_all_fields(&self, key: &str) -> Result<BTreeMap<String, String>, BackendError> {
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(field, value)| (field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, BackendError> {
        let records = self.records.read().await;
        let record = records.get(key);
        Ok(fields
            .iter()
            .map(|field| record.and_then(|values| values.get(field).cloned()))
            .collect())
    }

    async fn delete_fields(&self, key: &str, fields: &[String]) -> Result<usize, BackendError> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields
            .iter()
            .filter(|field| record.remove(field.as_str()).is_some())
            .count();
        if record.is_empty() {
            records.remove(key);
        }
        Ok(removed)
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, BackendError> {
        let records = self.records.read().await;
        Ok(records
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
