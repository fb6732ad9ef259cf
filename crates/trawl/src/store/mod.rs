//! Entry store client
//!
//! One [`StoreConnection`] owns exactly one TCP link to the entry store. The
//! link is mode-scoped: after [`Mode::Insert`] every write is an entry, after
//! [`Mode::Query`] the connection answers validate/fetch/single/admin
//! commands until a live query is attached, at which point it only streams.
//!
//! Consumers never dial directly; they receive a [`StoreDialer`] so tests can
//! substitute an in-memory store.

pub mod bootstrap;
pub mod protocol;
mod tcp;

pub use tcp::{TcpDialer, TcpStoreConnection};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a store connection
#[derive(Error, Debug)]
pub enum StoreError {
    /// Dialing the store failed; always retryable
    #[error("cannot connect to store at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// The store refused the requested operating mode
    #[error("store refused {mode} mode: {reason}")]
    Mode { mode: Mode, reason: String },

    /// The store judged the query invalid
    #[error("{0}")]
    Validation(String),

    /// A bounded fetch failed
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The store refused to attach a live query
    #[error("live query refused: {0}")]
    Query(String),

    /// The store answered `err` to a single/admin command
    #[error("store rejected command: {0}")]
    Rejected(String),

    /// No answer within the caller's bound
    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    /// Operation not allowed in the connection's current state
    #[error("connection is not ready: {0}")]
    State(String),

    /// Malformed reply line
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store hung up
    #[error("connection closed by store")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operating mode of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Insert,
    Query,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Insert => write!(f, "insert"),
            Mode::Query => write!(f, "query"),
        }
    }
}

/// Fetch direction relative to the cursor; `-1` on the wire is newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    #[default]
    Backward,
    Forward,
}

impl From<Direction> for i8 {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Backward => -1,
            Direction::Forward => 1,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Direction::Backward),
            1 => Ok(Direction::Forward),
            other => Err(format!("direction must be -1 or 1, got {other}")),
        }
    }
}

/// Arguments of a bounded historical fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub left_off: String,
    pub direction: Direction,
    pub query: String,
    pub limit: u64,
}

/// Raw result of a fetch: entries in store order plus the bracketing metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchBatch {
    pub entries: Vec<Bytes>,
    pub first_meta: Bytes,
    pub last_meta: Bytes,
}

/// Sinks a live query pushes raw entries and metadata into.
///
/// Both senders are dropped when the query ends, for whatever reason, so a
/// listener sees `None` exactly when the stream is over.
#[derive(Debug)]
pub struct LiveFeeds {
    pub data: mpsc::Sender<Bytes>,
    pub meta: mpsc::Sender<Bytes>,
}

/// Administrative calls issued once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Macro { name: String, expanded: String },
    Limit(u64),
    InsertionFilter(String),
}

/// A single, exclusively owned link to the entry store
#[async_trait]
pub trait StoreConnection: Send {
    /// Negotiate the operating mode for the rest of the link's life
    async fn set_mode(&mut self, mode: Mode) -> Result<(), StoreError>;

    /// Send one serialized entry (insert mode only)
    async fn insert(&mut self, raw: &[u8]) -> Result<(), StoreError>;

    /// Ask the store whether `query` is well formed
    async fn validate(&mut self, query: &str) -> Result<(), StoreError>;

    /// Bounded historical fetch; entries come back in store order
    async fn fetch(
        &mut self,
        request: &FetchRequest,
        timeout: Duration,
    ) -> Result<FetchBatch, StoreError>;

    /// Attach a live query; matching entries and metadata flow into `feeds`
    /// until the connection is closed or the link breaks
    async fn live_query(
        &mut self,
        cursor: &str,
        query: &str,
        feeds: LiveFeeds,
    ) -> Result<(), StoreError>;

    /// Look one entry up by id, filtered by `query`
    async fn single(&mut self, id: &str, query: &str) -> Result<Bytes, StoreError>;

    /// Issue an administrative command
    async fn admin(&mut self, command: AdminCommand) -> Result<(), StoreError>;

    /// Release the link and stop any live reader; idempotent
    async fn close(&mut self);
}

/// Factory for store connections
#[async_trait]
pub trait StoreDialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}
