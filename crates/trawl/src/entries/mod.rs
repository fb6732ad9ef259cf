//! Paginated historical queries and single-entry lookup
//!
//! Every call runs on its own short-lived store connection: dial, query
//! mode, validate, ask, close.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::classify::{CapabilityRegistry, ClassifyError};
use crate::entry::{Entry, EntryWrapper, Metadata, Summary};
use crate::store::{Direction, FetchRequest, Mode, StoreConnection, StoreDialer, StoreError};

#[derive(Error, Debug)]
pub enum EntriesError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("undecodable entry: {0}")]
    Decode(String),
}

impl EntriesError {
    /// Whether the caller sent a bad query rather than the store failing
    pub fn is_invalid_query(&self) -> bool {
        matches!(self, EntriesError::Store(StoreError::Validation(_)))
    }
}

/// A page request, as sent in the query string of `GET /entries`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntriesRequest {
    #[serde(default = "default_left_off")]
    pub left_off: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_left_off() -> String {
    "latest".to_string()
}

fn default_limit() -> u64 {
    100
}

impl Default for EntriesRequest {
    fn default() -> Self {
        Self {
            left_off: default_left_off(),
            direction: Direction::default(),
            query: String::new(),
            limit: default_limit(),
            timeout_ms: None,
        }
    }
}

/// One page of summaries plus the store's position after it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntriesPage {
    pub data: Vec<Summary>,
    pub meta: Option<Metadata>,
}

pub struct EntriesProvider {
    dialer: Arc<dyn StoreDialer>,
    registry: Arc<CapabilityRegistry>,
    default_timeout: Duration,
}

impl EntriesProvider {
    pub fn new(
        dialer: Arc<dyn StoreDialer>,
        registry: Arc<CapabilityRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            dialer,
            registry,
            default_timeout,
        }
    }

    async fn open(&self, query: &str) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut connection = self.dialer.dial().await?;
        let ready = async {
            connection.set_mode(Mode::Query).await?;
            connection.validate(query).await
        }
        .await;
        match ready {
            Ok(()) => Ok(connection),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Fetch a page of entries and summarize each through its capability.
    ///
    /// Entries come back in store order. An entry whose protocol is not
    /// registered fails the whole page.
    pub async fn get_entries(&self, request: &EntriesRequest) -> Result<EntriesPage, EntriesError> {
        let mut connection = self.open(&request.query).await?;
        let timeout = request
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let fetched = connection
            .fetch(
                &FetchRequest {
                    left_off: request.left_off.clone(),
                    direction: request.direction,
                    query: request.query.clone(),
                    limit: request.limit,
                },
                timeout,
            )
            .await;
        connection.close().await;
        let batch = fetched?;

        let mut data = Vec::with_capacity(batch.entries.len());
        for raw in &batch.entries {
            let entry: Entry =
                serde_json::from_slice(raw).map_err(|e| EntriesError::Decode(e.to_string()))?;
            data.push(self.registry.summarize(&entry)?);
        }

        let meta = match serde_json::from_slice::<Metadata>(&batch.last_meta) {
            Ok(meta) => Some(meta),
            Err(e) => {
                error!(error = %e, "Undecodable page metadata");
                None
            }
        };

        debug!(count = data.len(), query = %request.query, "Entries page served");
        Ok(EntriesPage { data, meta })
    }

    /// Look one entry up and build its full detail view
    pub async fn get_entry(&self, id: &str, query: &str) -> Result<EntryWrapper, EntriesError> {
        let mut connection = self.open(query).await?;
        let found = connection.single(id, query).await;
        connection.close().await;
        let raw = found?;

        let entry: Entry = serde_json::from_slice(&raw)
            .map_err(|_| EntriesError::Decode(String::from_utf8_lossy(&raw).into_owned()))?;
        Ok(self.registry.wrap(entry)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ProtocolSummary;
    use crate::store::FetchBatch;
    use crate::testing::{MockStore, metadata_bytes, sample_entry, sample_entry_bytes};
    use bytes::Bytes;

    fn provider(store: &Arc<MockStore>) -> EntriesProvider {
        EntriesProvider::new(
            store.clone(),
            Arc::new(CapabilityRegistry::with_defaults()),
            Duration::from_millis(3000),
        )
    }

    #[tokio::test]
    async fn test_get_entries_summarizes_in_store_order() {
        let store = Arc::new(MockStore::new());
        store.set_fetch_result(Ok(FetchBatch {
            entries: vec![sample_entry_bytes("3"), sample_entry_bytes("2")],
            first_meta: metadata_bytes("c3"),
            last_meta: metadata_bytes("c2"),
        }));

        let page = provider(&store)
            .get_entries(&EntriesRequest {
                query: "http".to_string(),
                limit: 2,
                ..EntriesRequest::default()
            })
            .await
            .unwrap();

        let ids: Vec<&str> = page.data.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
        assert_eq!(page.data[0].method, "GET");
        assert_eq!(page.meta.unwrap().left_off, "c2");
        assert_eq!(store.fetch_requests()[0].limit, 2);
        assert_eq!(store.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_get_entries_rejects_invalid_query_before_fetch() {
        let store = Arc::new(MockStore::new());
        store.reject_query("status ==", "missing operand");

        let err = provider(&store)
            .get_entries(&EntriesRequest {
                query: "status ==".to_string(),
                ..EntriesRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_invalid_query());
        assert!(store.fetch_requests().is_empty());
        assert_eq!(store.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_get_entries_unknown_protocol_fails() {
        let store = Arc::new(MockStore::new());
        let mut entry = sample_entry("1");
        entry.protocol = ProtocolSummary {
            name: "gopher".to_string(),
            version: "0".to_string(),
            abbr: "GPH".to_string(),
        };
        store.set_fetch_result(Ok(FetchBatch {
            entries: vec![Bytes::from(serde_json::to_vec(&entry).unwrap())],
            first_meta: metadata_bytes("c1"),
            last_meta: metadata_bytes("c1"),
        }));

        let err = provider(&store)
            .get_entries(&EntriesRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EntriesError::Classify(_)));
    }

    #[tokio::test]
    async fn test_get_entries_uses_default_timeout_for_zero() {
        let store = Arc::new(MockStore::new());
        store.set_fetch_delay(Duration::from_millis(50));

        let page = provider(&store)
            .get_entries(&EntriesRequest {
                timeout_ms: Some(0),
                ..EntriesRequest::default()
            })
            .await
            .unwrap();
        assert!(page.data.is_empty());
        assert!(page.meta.is_none());
    }

    #[tokio::test]
    async fn test_get_entry_wraps_with_representation() {
        let store = Arc::new(MockStore::new());
        store.put_entry("42", sample_entry_bytes("42"));

        let wrapper = provider(&store).get_entry("42", "").await.unwrap();
        assert_eq!(wrapper.data.id, "42");
        assert_eq!(wrapper.base.status, 200);
        assert!(!wrapper.representation.is_empty());
    }

    #[tokio::test]
    async fn test_get_entry_missing_is_store_error() {
        let store = Arc::new(MockStore::new());
        let err = provider(&store).get_entry("nope", "").await.unwrap_err();
        assert!(matches!(err, EntriesError::Store(StoreError::Rejected(_))));
    }

    #[test]
    fn test_request_defaults() {
        let request: EntriesRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request, EntriesRequest::default());
        assert_eq!(request.limit, 100);
    }
}
