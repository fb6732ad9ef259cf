//! Per-subscriber live streaming
//!
//! A [`StreamController`] validates a subscriber's query, optionally replays
//! a bounded slice of history oldest-first, then tails the store until the
//! subscriber cancels or the link fails.

mod controller;
mod transport;

pub use controller::StreamController;
pub use transport::{DeliveryError, SubscriberId, SubscriberTransport};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::store::{Direction, StoreError};

/// Lifecycle of one subscription; `Closed` and `Errored` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Validating,
    Fetching,
    Live,
    Closed,
    Errored,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Errored)
    }
}

/// What a subscriber asks for when it (re)starts its stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    #[serde(default)]
    pub query: String,
    #[serde(default = "default_left_off")]
    pub left_off: String,
    /// Entries of history to replay before going live; 0 = live only
    #[serde(default)]
    pub fetch: u64,
    #[serde(default)]
    pub direction: Direction,
    /// Bound on the historical fetch; the gateway default applies when absent
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Send whole entries instead of summaries
    #[serde(default)]
    pub enable_full_entries: bool,
}

fn default_left_off() -> String {
    "latest".to_string()
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            left_off: default_left_off(),
            fetch: 0,
            direction: Direction::default(),
            timeout_ms: None,
            enable_full_entries: false,
        }
    }
}

impl StreamParams {
    pub fn fetch_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }
}

/// Why a subscription ended other than by cancellation
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("cannot open store connection: {0}")]
    Open(#[source] StoreError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query validation failed: {0}")]
    Validate(#[source] StoreError),

    #[error("live query failed: {0}")]
    Live(#[source] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("live feeds ended")]
    FeedsEnded,
}
