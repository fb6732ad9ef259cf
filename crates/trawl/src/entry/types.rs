//! Entry types for the Trawl gateway
//!
//! Defines the captured-transaction record stored in the entry store, the
//! raw capture item it is analyzed from, and the list/detail views the
//! gateway hands to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::classify::Protocol;

/// Protocol identity carried by every entry: enough to look the full
/// [`Protocol`] up in the capability registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ProtocolSummary {
    pub name: String,
    pub version: String,
    pub abbr: String,
}

impl ProtocolSummary {
    /// Registry key in the form `name/version/abbr`
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.abbr)
    }
}

/// One side of a TCP conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tcp {
    pub ip: String,
    pub port: String,
    #[serde(default)]
    pub name: String,
}

/// An immutable record of one captured transaction.
///
/// Produced once (by capture analysis or by replay reconstruction) and never
/// mutated; the store assigns `id` on insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    pub protocol: ProtocolSummary,
    #[serde(default)]
    pub capture: String,
    pub src: Tcp,
    pub dst: Tcp,
    #[serde(default)]
    pub outgoing: bool,
    /// Unix milliseconds
    pub timestamp: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub request: Map<String, Value>,
    #[serde(default)]
    pub response: Map<String, Value>,
    #[serde(default)]
    pub request_size: u64,
    #[serde(default)]
    pub response_size: u64,
    /// Milliseconds between request and response capture
    #[serde(default)]
    pub elapsed_time: i64,
}

/// Store-reported position and bookkeeping accompanying a fetch or live batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub current: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub number_of_written: u64,
    /// Opaque resume cursor
    pub left_off: String,
    #[serde(default)]
    pub truncated_timestamp: i64,
}

/// Compact list view of an entry, computed by its protocol capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: String,
    pub protocol: Protocol,
    pub capture: String,
    pub summary: String,
    pub summary_query: String,
    pub status: u16,
    pub status_query: String,
    pub method: String,
    pub method_query: String,
    pub timestamp: i64,
    pub src: Tcp,
    pub dst: Tcp,
    pub outgoing: bool,
    pub latency: i64,
}

/// Full detail view: raw entry plus its summary and representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryWrapper {
    pub protocol: Protocol,
    pub representation: String,
    pub data: Entry,
    pub base: Summary,
}

/// Endpoints of a captured connection as seen by the capture agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_ip: String,
    pub client_port: String,
    pub server_ip: String,
    pub server_port: String,
    #[serde(default)]
    pub is_outgoing: bool,
}

/// One captured message (request or response) before analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericMessage {
    pub is_request: bool,
    pub capture_time: DateTime<Utc>,
    #[serde(default)]
    pub capture_size: u64,
    /// Protocol-specific payload, interpreted only by the capability
    pub payload: Value,
}

/// Request/response pair of a captured exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponsePair {
    pub request: GenericMessage,
    pub response: GenericMessage,
}

/// Raw output of the capture pipeline, analyzed into an [`Entry`] by the
/// capability registered for its protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureItem {
    pub protocol: ProtocolSummary,
    pub connection_info: ConnectionInfo,
    #[serde(default)]
    pub capture: String,
    /// Unix milliseconds
    pub timestamp: i64,
    pub pair: RequestResponsePair,
}

impl CaptureItem {
    /// Milliseconds between request and response capture, never negative
    pub fn elapsed_ms(&self) -> i64 {
        (self.pair.response.capture_time - self.pair.request.capture_time)
            .num_milliseconds()
            .max(0)
    }
}
