pub mod prefix_table;

pub use prefix_table::{PrefixMap, PrefixNode, PrefixTable, PrefixTableError};

use chrono::{DateTime, Utc};
use portia_core::{parse_timestamp, Entry, Msisdn, ResolutionResult, Strategy, WellKnownKey};
use portia_storage::{AnnotationStore, StorageError};
use std::sync::Arc;
use tracing::debug;

/// Evidence read back from one resolvable annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub strategy: Strategy,
    pub network: &'a str,
    pub timestamp: DateTime<Utc>,
}

/// Rebuilds the resolvable annotations of `entry` in tie-break order.
/// Unreadable timestamps count as the oldest possible instant.
pub fn candidates(entry: &Entry) -> Vec<Candidate<'_>> {
    WellKnownKey::RESOLVABLE
        .into_iter()
        .filter_map(|key| {
            let strategy = Strategy::from_key(key)?;
            let network = entry.get(key.as_str())?;
            let timestamp = entry
                .get(&key.timestamp_field())
                .and_then(|raw| parse_timestamp(raw).ok())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            Some(Candidate {
                strategy,
                network,
                timestamp,
            })
        })
        .collect()
}

/// Newest candidate; on equal timestamps the earlier key wins.
pub fn pick_latest(entry: &Entry) -> Option<Candidate<'_>> {
    candidates(entry)
        .into_iter()
        .fold(None, |best: Option<Candidate<'_>>, candidate| match best {
            Some(current) if candidate.timestamp <= current.timestamp => Some(current),
            _ => Some(candidate),
        })
}

#[derive(Clone)]
pub struct ResolutionEngine {
    store: AnnotationStore,
    table: Arc<PrefixTable>,
}

impl ResolutionEngine {
    pub fn new(store: AnnotationStore, table: Arc<PrefixTable>) -> Self {
        Self { store, table }
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub async fn resolve(&self, msisdn: &Msisdn) -> Result<ResolutionResult, StorageError> {
        let entry = self.store.get_annotations(msisdn).await?;
        let (network, strategy) = match pick_latest(&entry) {
            Some(candidate) => (Some(candidate.network.to_string()), candidate.strategy),
            None => (
                self.table.lookup(msisdn.as_str()).map(str::to_string),
                Strategy::PrefixGuess,
            ),
        };
        debug!(
            event = "resolved",
            msisdn = %msisdn,
            strategy = %strategy,
            network = network.as_deref().unwrap_or("")
        );
        Ok(ResolutionResult {
            network,
            strategy,
            entry,
        })
    }
}
