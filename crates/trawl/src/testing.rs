//! Test utilities for trawl - sample data and in-memory doubles
//!
//! - [`MockStore`]: an in-memory [`StoreDialer`] whose connections record
//!   every call and can be told to fail
//! - [`RecordingTransport`]: a [`SubscriberTransport`] that remembers what
//!   each subscriber was sent

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::entry::{Entry, Metadata, ProtocolSummary, Tcp};
use crate::store::{
    AdminCommand, FetchBatch, FetchRequest, LiveFeeds, Mode, StoreConnection, StoreDialer,
    StoreError,
};
use crate::stream::{DeliveryError, StreamParams, SubscriberId, SubscriberTransport};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// An HTTP/1.1 entry as the store would hand it back
pub fn sample_entry(id: &str) -> Entry {
    let start = Utc
        .timestamp_millis_opt(1_700_000_000_000)
        .single()
        .unwrap_or_else(Utc::now);
    Entry {
        id: id.to_string(),
        protocol: ProtocolSummary {
            name: "http".to_string(),
            version: "1.1".to_string(),
            abbr: "HTTP".to_string(),
        },
        capture: "ebpf".to_string(),
        src: Tcp {
            ip: "10.0.0.1".to_string(),
            port: "51234".to_string(),
            name: "frontend".to_string(),
        },
        dst: Tcp {
            ip: "10.0.0.2".to_string(),
            port: "80".to_string(),
            name: "catalogue".to_string(),
        },
        outgoing: false,
        timestamp: 1_700_000_000_000,
        start_time: start,
        request: object(json!({
            "method": "GET",
            "url": format!("http://catalogue/items/{id}"),
            "host": "catalogue",
            "path": format!("/items/{id}"),
            "httpVersion": "HTTP/1.1",
            "headers": [{"name": "accept", "value": "application/json"}],
            "queryString": [],
            "body": "",
            "bodySize": 0,
        })),
        response: object(json!({
            "status": 200,
            "statusText": "OK",
            "httpVersion": "HTTP/1.1",
            "headers": [{"name": "content-type", "value": "application/json"}],
            "body": "{}",
            "bodySize": 2,
        })),
        request_size: 120,
        response_size: 2048,
        elapsed_time: 12,
    }
}

/// [`sample_entry`] as raw store bytes
pub fn sample_entry_bytes(id: &str) -> Bytes {
    Bytes::from(serde_json::to_vec(&sample_entry(id)).unwrap_or_default())
}

pub fn metadata(left_off: &str) -> Metadata {
    Metadata {
        left_off: left_off.to_string(),
        ..Metadata::default()
    }
}

pub fn metadata_bytes(left_off: &str) -> Bytes {
    Bytes::from(serde_json::to_vec(&metadata(left_off)).unwrap_or_default())
}

/// Poll `check` every few milliseconds for up to two seconds
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MockState {
    unavailable: bool,
    failing_dials: usize,
    dials: usize,
    closed: usize,
    modes: Vec<Mode>,
    invalid_queries: HashMap<String, String>,
    fetch_result: Option<Result<FetchBatch, String>>,
    fetch_delay: Option<Duration>,
    fetch_requests: Vec<FetchRequest>,
    live_cursors: Vec<String>,
    live_feeds: Vec<(usize, LiveFeeds)>,
    failing_inserts: usize,
    inserted: Vec<(usize, Bytes)>,
    singles: HashMap<String, Bytes>,
    admin: Vec<AdminCommand>,
    insertion_filter_rejection: Option<String>,
    mode_rejection: Option<String>,
}

/// In-memory entry store
#[derive(Default, Clone)]
pub struct MockStore {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicUsize>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) every dial
    pub fn set_available(&self, available: bool) {
        lock(&self.state).unavailable = !available;
    }

    /// Refuse the next `count` dials, then accept
    pub fn fail_next_dials(&self, count: usize) {
        lock(&self.state).failing_dials = count;
    }

    /// Make `validate(query)` fail with `message`
    pub fn reject_query(&self, query: &str, message: &str) {
        lock(&self.state)
            .invalid_queries
            .insert(query.to_string(), message.to_string());
    }

    pub fn set_fetch_result(&self, result: Result<FetchBatch, String>) {
        lock(&self.state).fetch_result = Some(result);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.state).fetch_delay = Some(delay);
    }

    /// Fail the next `count` inserts with a broken pipe
    pub fn fail_next_inserts(&self, count: usize) {
        lock(&self.state).failing_inserts = count;
    }

    /// Make `single(id)` answer with `raw`
    pub fn put_entry(&self, id: &str, raw: Bytes) {
        lock(&self.state).singles.insert(id.to_string(), raw);
    }

    /// Refuse every mode negotiation with `message`
    pub fn reject_modes(&self, message: &str) {
        lock(&self.state).mode_rejection = Some(message.to_string());
    }

    pub fn reject_insertion_filter(&self, message: &str) {
        lock(&self.state).insertion_filter_rejection = Some(message.to_string());
    }

    pub fn dial_count(&self) -> usize {
        lock(&self.state).dials
    }

    pub fn closed_connections(&self) -> usize {
        lock(&self.state).closed
    }

    pub fn modes(&self) -> Vec<Mode> {
        lock(&self.state).modes.clone()
    }

    pub fn fetch_requests(&self) -> Vec<FetchRequest> {
        lock(&self.state).fetch_requests.clone()
    }

    pub fn live_cursors(&self) -> Vec<String> {
        lock(&self.state).live_cursors.clone()
    }

    /// Entries received, paired with the connection that carried them
    pub fn inserted(&self) -> Vec<(usize, Bytes)> {
        lock(&self.state).inserted.clone()
    }

    pub fn admin_log(&self) -> Vec<AdminCommand> {
        lock(&self.state).admin.clone()
    }

    /// Wait until a live query is attached
    pub async fn wait_for_live(&self) {
        let attached = eventually(|| !lock(&self.state).live_feeds.is_empty()).await;
        assert!(attached, "no live query was attached");
    }

    /// Push a raw entry into the most recent live query
    pub fn push_entry(&self, raw: Bytes) -> bool {
        let state = lock(&self.state);
        state
            .live_feeds
            .last()
            .is_some_and(|(_, feeds)| feeds.data.try_send(raw).is_ok())
    }

    /// Push raw metadata into the most recent live query
    pub fn push_metadata(&self, raw: Bytes) -> bool {
        let state = lock(&self.state);
        state
            .live_feeds
            .last()
            .is_some_and(|(_, feeds)| feeds.meta.try_send(raw).is_ok())
    }

    /// Simulate the store dropping every live query
    pub fn break_live_feeds(&self) {
        lock(&self.state).live_feeds.clear();
    }
}

#[async_trait]
impl StoreDialer for MockStore {
    async fn dial(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut state = lock(&self.state);
        if state.unavailable || state.failing_dials > 0 {
            state.failing_dials = state.failing_dials.saturating_sub(1);
            return Err(StoreError::Connect {
                addr: "mock".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.dials += 1;
        Ok(Box::new(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MockConnection {
    id: usize,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockConnection {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreConnection for MockConnection {
    async fn set_mode(&mut self, mode: Mode) -> Result<(), StoreError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        if let Some(reason) = state.mode_rejection.clone() {
            return Err(StoreError::Mode { mode, reason });
        }
        state.modes.push(mode);
        Ok(())
    }

    async fn insert(&mut self, raw: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        if state.failing_inserts > 0 {
            state.failing_inserts -= 1;
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        state.inserted.push((self.id, Bytes::copy_from_slice(raw)));
        Ok(())
    }

    async fn validate(&mut self, query: &str) -> Result<(), StoreError> {
        self.check_open()?;
        match lock(&self.state).invalid_queries.get(query) {
            Some(message) => Err(StoreError::Validation(message.clone())),
            None => Ok(()),
        }
    }

    async fn fetch(
        &mut self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchBatch, StoreError> {
        self.check_open()?;
        let (delay, result) = {
            let mut state = lock(&self.state);
            state.fetch_requests.push(request.clone());
            (state.fetch_delay, state.fetch_result.clone())
        };

        if let Some(delay) = delay {
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(StoreError::Timeout(timeout));
            }
            tokio::time::sleep(delay).await;
        }

        match result {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(StoreError::Fetch(message)),
            None => Ok(FetchBatch::default()),
        }
    }

    async fn live_query(
        &mut self,
        cursor: &str,
        _query: &str,
        feeds: LiveFeeds,
    ) -> Result<(), StoreError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        state.live_cursors.push(cursor.to_string());
        state.live_feeds.push((self.id, feeds));
        Ok(())
    }

    async fn single(&mut self, id: &str, _query: &str) -> Result<Bytes, StoreError> {
        self.check_open()?;
        lock(&self.state)
            .singles
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::Rejected(format!("entry {id} not found")))
    }

    async fn admin(&mut self, command: AdminCommand) -> Result<(), StoreError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        let rejection = match &command {
            AdminCommand::InsertionFilter(_) => state.insertion_filter_rejection.clone(),
            _ => None,
        };
        state.admin.push(command);
        match rejection {
            Some(message) => Err(StoreError::Rejected(message)),
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = lock(&self.state);
        state.closed += 1;
        let id = self.id;
        state.live_feeds.retain(|(owner, _)| *owner != id);
    }
}

/// What a subscriber was sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Id of the delivered entry
    Entry(String),
    /// Cursor carried by the metadata
    Metadata(String),
    Toast(String),
    Cleanup,
}

/// Subscriber transport that records everything it is asked to send
#[derive(Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<(SubscriberId, Delivery)>>,
    gone: Mutex<Vec<SubscriberId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every further delivery to `subscriber` fail
    pub fn disconnect(&self, subscriber: SubscriberId) {
        lock(&self.gone).push(subscriber);
    }

    fn record(&self, subscriber: SubscriberId, delivery: Delivery) -> Result<(), DeliveryError> {
        if lock(&self.gone).contains(&subscriber) {
            return Err(DeliveryError::Gone(subscriber));
        }
        lock(&self.deliveries).push((subscriber, delivery));
        Ok(())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.deliveries)
            .iter()
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn deliveries_for(&self, subscriber: SubscriberId) -> Vec<Delivery> {
        lock(&self.deliveries)
            .iter()
            .filter(|(s, _)| *s == subscriber)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Entry(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn metadata_cursors(&self) -> Vec<String> {
        self.deliveries()
            .into_iter()
            .filter_map(|d| match d {
                Delivery::Metadata(cursor) => Some(cursor),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` deliveries were recorded
    pub async fn wait_for_len(&self, count: usize) {
        let reached = eventually(|| lock(&self.deliveries).len() >= count).await;
        assert!(reached, "expected {count} deliveries, got {:?}", self.deliveries());
    }
}

#[async_trait]
impl SubscriberTransport for RecordingTransport {
    async fn send_entry(
        &self,
        subscriber: SubscriberId,
        entry: &Entry,
        _params: &StreamParams,
    ) -> Result<(), DeliveryError> {
        self.record(subscriber, Delivery::Entry(entry.id.clone()))
    }

    async fn send_metadata(
        &self,
        subscriber: SubscriberId,
        metadata: &Metadata,
    ) -> Result<(), DeliveryError> {
        self.record(subscriber, Delivery::Metadata(metadata.left_off.clone()))
    }

    async fn send_toast_error(
        &self,
        subscriber: SubscriberId,
        message: &str,
    ) -> Result<(), DeliveryError> {
        self.record(subscriber, Delivery::Toast(message.to_string()))
    }

    async fn cleanup_socket(&self, subscriber: SubscriberId) {
        lock(&self.deliveries).push((subscriber, Delivery::Cleanup));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_entry_round_trips_through_bytes() {
        let raw = sample_entry_bytes("5");
        let entry: Entry = serde_json::from_slice(&raw).unwrap();
        assert_eq!(entry, sample_entry("5"));
    }

    #[tokio::test]
    async fn mock_connection_close_is_idempotent() {
        let store = MockStore::new();
        let mut connection = store.dial().await.unwrap();
        connection.close().await;
        connection.close().await;
        assert_eq!(store.closed_connections(), 1);
        assert!(matches!(
            connection.validate("http").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn recording_transport_refuses_disconnected_subscribers() {
        let transport = RecordingTransport::new();
        transport.disconnect(SubscriberId(2));
        assert!(transport.send_toast_error(SubscriberId(2), "x").await.is_err());
        assert!(transport.send_toast_error(SubscriberId(3), "y").await.is_ok());
        assert_eq!(transport.deliveries(), vec![Delivery::Toast("y".to_string())]);
    }
}
