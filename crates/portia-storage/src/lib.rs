pub mod backend;
pub mod import;
pub mod sqlite;

pub use backend::{Backend, BackendError, MemoryBackend};
pub use import::{read_porting_records, ImportError};
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use portia_core::{
    format_timestamp, validate_annotate_key, AnnotationFields, AnnotationKey, Entry, InvalidKey,
    Msisdn,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_PREFIX: &str = "portia:";
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),
    #[error("No content supplied")]
    EmptyPayload,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend {operation} timed out after {timeout_ms}ms")]
    BackendTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl StorageError {
    /// Failures caused by the caller's input rather than the backend.
    pub fn is_validation(&self) -> bool {
        matches!(self, StorageError::InvalidKey(_) | StorageError::EmptyPayload)
    }
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub prefix: String,
    pub backend_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
        }
    }
}

/// Annotation records layered over a shared backend. Keys are
/// `prefix + msisdn` with no escaping, so neither part may contain the
/// backend's own key separator.
#[derive(Clone)]
pub struct AnnotationStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
}

impl AnnotationStore {
    pub fn new(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    pub fn record_key(&self, msisdn: &Msisdn) -> String {
        format!("{}{}", self.config.prefix, msisdn)
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(result) => result.map_err(StorageError::from),
            Err(_) => {
                let timeout_ms = self.config.backend_timeout.as_millis() as u64;
                warn!(event = "backend_timeout", operation, timeout_ms);
                Err(StorageError::BackendTimeout {
                    operation,
                    timeout_ms,
                })
            }
        }
    }

    /// Writes `<key>` and `<key>-timestamp` in one backend call and returns
    /// the stored pair.
    pub async fn annotate(
        &self,
        msisdn: &Msisdn,
        key: &str,
        value: &str,
        timestamp: impl Into<DateTime<Utc>>,
    ) -> Result<Entry, StorageError> {
        let key = validate_annotate_key(key)?;
        if value.is_empty() {
            return Err(StorageError::EmptyPayload);
        }
        let timestamp = format_timestamp(&timestamp.into());
        let [value_field, timestamp_field] = key.fields();
        let fields = vec![
            (value_field, value.to_string()),
            (timestamp_field, timestamp),
        ];

        let record_key = self.record_key(msisdn);
        self.call("set_fields", self.backend.set_fields(&record_key, fields.clone()))
            .await?;
        debug!(event = "annotated", msisdn = %msisdn, key = %key);
        Ok(fields.into_iter().collect())
    }

    pub async fn get_annotations(&self, msisdn: &Msisdn) -> Result<Entry, StorageError> {
        let record_key = self.record_key(msisdn);
        self.call("get_all_fields", self.backend.get_all_fields(&record_key))
            .await
    }

    pub async fn read_annotation(
        &self,
        msisdn: &Msisdn,
        key: &str,
    ) -> Result<AnnotationFields, StorageError> {
        let key = validate_annotate_key(key)?;
        let fields = key.fields();
        let record_key = self.record_key(msisdn);
        let values = self
            .call("get_fields", self.backend.get_fields(&record_key, &fields))
            .await?;
        Ok(fields
            .into_iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .collect())
    }

    /// Validates every key before deleting anything.
    pub async fn remove_annotations<S: AsRef<str>>(
        &self,
        msisdn: &Msisdn,
        keys: &[S],
    ) -> Result<bool, StorageError> {
        let keys = keys
            .iter()
            .map(|key| validate_annotate_key(key.as_ref()))
            .collect::<Result<Vec<AnnotationKey>, _>>()?;
        let fields = keys
            .iter()
            .flat_map(AnnotationKey::fields)
            .collect::<Vec<_>>();
        if fields.is_empty() {
            return Ok(false);
        }
        let record_key = self.record_key(msisdn);
        let removed = self
            .call("delete_fields", self.backend.delete_fields(&record_key, &fields))
            .await?;
        Ok(removed > 0)
    }

    pub async fn remove(&self, msisdn: &Msisdn) -> Result<bool, StorageError> {
        let record_key = self.record_key(msisdn);
        self.call("delete_key", self.backend.delete_key(&record_key))
            .await
    }

    /// Deletes every record under this store's prefix. Administrative only.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let keys = self
            .call("list_keys", self.backend.list_keys(&self.config.prefix))
            .await?;
        let results = join_all(
            keys.iter()
                .map(|key| self.call("delete_key", self.backend.delete_key(key))),
        )
        .await;
        let mut deleted = 0;
        for result in results {
            if result? {
                deleted += 1;
            }
        }
        info!(event = "store_flushed", prefix = %self.config.prefix, deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, FixedOffset, TimeZone};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msisdn() -> Msisdn {
        Msisdn::parse("27123456789").expect("msisdn")
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 6, 1, 12, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[derive(Default)]
    struct RecordingBackend {
        inner: MemoryBackend,
        calls: AtomicUsize,
    }

    impl RecordingBackend {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn set_fields(
            &self,
            key: &str,
            fields: Vec<(String, String)>,
        ) -> Result<(), BackendError> {
            self.touch();
            self.inner.set_fields(key, fields).await
        }

        async fn get_all_fields(
            &self,
            key: &str,
        ) -> Result<BTreeMap<String, String>, BackendError> {
            self.touch();
            self.inner.get_all_fields(key).await
        }

        async fn get_fields(
            &self,
            key: &str,
            fields: &[String],
        ) -> Result<Vec<Option<String>>, BackendError> {
            self.touch();
            self.inner.get_fields(key, fields).await
        }

        async fn delete_fields(
            &self,
            key: &str,
            fields: &[String],
        ) -> Result<usize, BackendError> {
            self.touch();
            self.inner.delete_fields(key, fields).await
        }

        async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
            self.touch();
            self.inner.delete_key(key).await
        }

        async fn list_keys(&self, prefix: &str) -> Result<BTreeSet<String>, BackendError> {
            self.touch();
            self.inner.list_keys(prefix).await
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl Backend for StalledBackend {
        async fn set_fields(
            &self,
            _key: &str,
            _fields: Vec<(String, String)>,
        ) -> Result<(), BackendError> {
            std::future::pending().await
        }

        async fn get_all_fields(
            &self,
            _key: &str,
        ) -> Result<BTreeMap<String, String>, BackendError> {
            std::future::pending().await
        }

        async fn get_fields(
            &self,
            _key: &str,
            _fields: &[String],
        ) -> Result<Vec<Option<String>>, BackendError> {
            std::future::pending().await
        }

        async fn delete_fields(
            &self,
            _key: &str,
            _fields: &[String],
        ) -> Result<usize, BackendError> {
            std::future::pending().await
        }

        async fn delete_key(&self, _key: &str) -> Result<bool, BackendError> {
            std::future::pending().await
        }

        async fn list_keys(&self, _prefix: &str) -> Result<BTreeSet<String>, BackendError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn annotate_then_read_round_trips_in_utc() {
        let store = AnnotationStore::in_memory();
        let sast = FixedOffset::east_opt(2 * 3600).expect("offset");
        let local = sast
            .with_ymd_and_hms(2015, 6, 1, 14, 30, 0)
            .single()
            .expect("local time");

        for key in ["observed-network", "ported-to", "ported-from", "do-not-call", "X-foo"] {
            store
                .annotate(&msisdn(), key, "MNO", local)
                .await
                .expect("annotate");
            let read = store.read_annotation(&msisdn(), key).await.expect("read");
            assert_eq!(read.get(key).cloned().flatten().as_deref(), Some("MNO"));
            assert_eq!(
                read.get(&format!("{key}-timestamp"))
                    .cloned()
                    .flatten()
                    .as_deref(),
                Some("2015-06-01T12:30:00.000000Z")
            );
        }
    }

    #[tokio::test]
    async fn get_annotations_returns_every_field() {
        let store = AnnotationStore::in_memory();
        store
            .annotate(&msisdn(), "ported-to", "MNO", ts())
            .await
            .expect("annotate ported-to");
        store
            .annotate(&msisdn(), "X-foo", "bar", ts() - ChronoDuration::days(1))
            .await
            .expect("annotate X-foo");

        let entry = store.get_annotations(&msisdn()).await.expect("get");
        let expected: Entry = [
            ("X-foo", "bar"),
            ("X-foo-timestamp", "2015-05-31T12:30:00.000000Z"),
            ("ported-to", "MNO"),
            ("ported-to-timestamp", "2015-06-01T12:30:00.000000Z"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(entry, expected);
    }

    #[tokio::test]
    async fn missing_record_reads_empty() {
        let store = AnnotationStore::in_memory();
        assert!(store.get_annotations(&msisdn()).await.expect("get").is_empty());

        let read = store
            .read_annotation(&msisdn(), "ported-to")
            .await
            .expect("read");
        assert_eq!(read.len(), 2);
        assert_eq!(read.get("ported-to"), Some(&None));
        assert_eq!(read.get("ported-to-timestamp"), Some(&None));
    }

    #[tokio::test]
    async fn invalid_keys_never_reach_the_backend() {
        let backend = Arc::new(RecordingBackend::default());
        let store = AnnotationStore::new(backend.clone(), StoreConfig::default());

        let err = store
            .annotate(&msisdn(), "foo", "bar", ts())
            .await
            .expect_err("annotate invalid");
        assert_eq!(err.to_string(), "Invalid Key: foo");
        assert!(err.is_validation());

        assert!(matches!(
            store.read_annotation(&msisdn(), "network").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store
                .remove_annotations(&msisdn(), &["ported-to", "bogus"])
                .await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.annotate(&msisdn(), "X-empty", "", ts()).await,
            Err(StorageError::EmptyPayload)
        ));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn remove_annotations_is_all_or_nothing() {
        let store = AnnotationStore::in_memory();
        for key in ["ported-to", "X-foo", "X-xxx"] {
            store
                .annotate(&msisdn(), key, "v", ts())
                .await
                .expect("annotate");
        }

        assert!(store
            .remove_annotations(&msisdn(), &["ported-to", "nope"])
            .await
            .is_err());
        assert_eq!(store.get_annotations(&msisdn()).await.expect("get").len(), 6);

        assert!(store
            .remove_annotations(&msisdn(), &["ported-to", "X-xxx"])
            .await
            .expect("remove"));
        let entry = store.get_annotations(&msisdn()).await.expect("get");
        assert_eq!(
            entry.keys().cloned().collect::<Vec<_>>(),
            vec!["X-foo".to_string(), "X-foo-timestamp".to_string()]
        );

        assert!(!store
            .remove_annotations(&msisdn(), &["ported-to"])
            .await
            .expect("remove again"));
    }

    #[tokio::test]
    async fn remove_reports_whether_record_existed() {
        let store = AnnotationStore::in_memory();
        store
            .annotate(&msisdn(), "ported-to", "MNO", ts())
            .await
            .expect("annotate");
        assert!(store.remove(&msisdn()).await.expect("remove"));
        assert!(!store.remove(&msisdn()).await.expect("remove again"));
    }

    #[tokio::test]
    async fn flush_only_touches_own_prefix() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let store = AnnotationStore::new(backend.clone(), StoreConfig::default());
        let neighbour = AnnotationStore::new(
            backend,
            StoreConfig {
                prefix: "other:".to_string(),
                ..StoreConfig::default()
            },
        );
        let second = Msisdn::parse("27123456780").expect("second msisdn");

        store
            .annotate(&msisdn(), "ported-to", "MNO", ts())
            .await
            .expect("annotate");
        store
            .annotate(&second, "X-foo", "bar", ts())
            .await
            .expect("annotate second");
        neighbour
            .annotate(&msisdn(), "X-foo", "bar", ts())
            .await
            .expect("annotate neighbour");

        assert_eq!(store.flush().await.expect("flush"), 2);
        assert!(store.get_annotations(&msisdn()).await.expect("get").is_empty());
        assert!(store.get_annotations(&second).await.expect("get").is_empty());
        assert!(!neighbour
            .get_annotations(&msisdn())
            .await
            .expect("neighbour")
            .is_empty());
    }

    #[tokio::test]
    async fn stalled_backend_surfaces_timeout() {
        let store = AnnotationStore::new(
            Arc::new(StalledBackend),
            StoreConfig {
                backend_timeout: Duration::from_millis(20),
                ..StoreConfig::default()
            },
        );
        let err = store
            .get_annotations(&msisdn())
            .await
            .expect_err("timeout");
        assert!(matches!(
            err,
            StorageError::BackendTimeout {
                operation: "get_all_fields",
                timeout_ms: 20
            }
        ));
        assert!(!err.is_validation());
    }
}
