//! Protocol capability registry
//!
//! Every supported protocol contributes a capability bundle that knows how to
//! analyze a raw capture item into an [`Entry`], summarize an entry for list
//! views, and render a full representation for detail views. The registry is
//! built once at startup from a fixed, priority-ordered list and looked up by
//! name at runtime; an unknown protocol is always an error.

mod generic;
mod http;

pub use generic::GenericCapability;
pub use http::{HttpCapability, HttpRequestPayload, HttpResponsePayload};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::entry::{CaptureItem, Entry, EntryWrapper, ProtocolSummary, Summary};

/// Errors raised while resolving or applying a protocol capability
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    /// No protocol registered under this `name/version/abbr` key
    #[error("protocol not found: {0}")]
    ProtocolNotFound(String),

    /// No capability bundle registered under this name
    #[error("capability not found: {0}")]
    NotFound(String),

    /// Capture item could not be turned into an entry
    #[error("cannot analyze {protocol} capture: {reason}")]
    Analyze { protocol: String, reason: String },

    /// Entry payloads could not be rendered
    #[error("cannot represent {protocol} entry: {reason}")]
    Represent { protocol: String, reason: String },
}

/// Static description of one protocol variant a capability claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub name: String,
    pub long_name: String,
    pub abbr: String,
    #[serde(rename = "macro")]
    pub macro_name: String,
    pub version: String,
    pub background_color: String,
    pub foreground_color: String,
    pub font_size: u8,
    pub reference_link: String,
    pub ports: Vec<String>,
    /// Lower values win when several capabilities could claim the same traffic
    pub priority: u8,
}

impl Protocol {
    pub fn summary(&self) -> ProtocolSummary {
        ProtocolSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            abbr: self.abbr.clone(),
        }
    }

    pub fn key(&self) -> String {
        self.summary().key()
    }
}

/// Per-protocol summarize/represent/analyze bundle
///
/// Implementations handle the protocol-specific shape of capture payloads;
/// the gateway core only ever talks to them through this trait.
pub trait ProtocolCapability: Send + Sync {
    /// Capability name, matched against [`Protocol::name`]
    fn name(&self) -> &str;

    /// Protocol variants this capability claims, in declaration order
    fn protocols(&self) -> &[Protocol];

    /// Query-language shorthands registered with the store at startup
    fn macros(&self) -> Vec<(String, String)>;

    /// Turn a raw capture item into an entry
    fn analyze(&self, item: &CaptureItem) -> Result<Entry, ClassifyError>;

    /// Compute the list view of an entry
    fn summarize(&self, entry: &Entry) -> Result<Summary, ClassifyError>;

    /// Render the request/response payloads for detail views
    fn represent(
        &self,
        request: &Map<String, Value>,
        response: &Map<String, Value>,
    ) -> Result<Vec<u8>, ClassifyError>;

    /// Lowest priority value among the claimed protocols
    fn priority(&self) -> u8 {
        self.protocols()
            .iter()
            .map(|p| p.priority)
            .min()
            .unwrap_or(u8::MAX)
    }

    /// The claimed protocol variant matching `summary`
    fn protocol_for(&self, summary: &ProtocolSummary) -> Result<Protocol, ClassifyError> {
        let key = summary.key();
        self.protocols()
            .iter()
            .find(|p| p.key() == key)
            .cloned()
            .ok_or(ClassifyError::ProtocolNotFound(key))
    }
}

/// Fixed registry of protocol capabilities, built once at process start
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn ProtocolCapability>>,
    protocols: HashMap<String, Protocol>,
}

impl CapabilityRegistry {
    /// Build a registry from an ordered list of capabilities.
    ///
    /// Capabilities are kept sorted by [`ProtocolCapability::priority`]; the
    /// sort is stable so equal priorities keep their configured order.
    pub fn new(mut capabilities: Vec<Arc<dyn ProtocolCapability>>) -> Self {
        capabilities.sort_by_key(|c| c.priority());

        let mut protocols = HashMap::new();
        for capability in &capabilities {
            for protocol in capability.protocols() {
                protocols
                    .entry(protocol.key())
                    .or_insert_with(|| protocol.clone());
            }
        }

        Self {
            capabilities,
            protocols,
        }
    }

    /// Registry with every protocol the gateway ships with
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(HttpCapability::new()),
            Arc::new(GenericCapability::amqp()),
            Arc::new(GenericCapability::kafka()),
            Arc::new(GenericCapability::redis()),
        ])
    }

    /// Look a capability up by name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProtocolCapability>, ClassifyError> {
        self.capabilities
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| ClassifyError::NotFound(name.to_string()))
    }

    /// Look the full protocol description up from an entry's summary
    pub fn protocol(&self, summary: &ProtocolSummary) -> Result<&Protocol, ClassifyError> {
        let key = summary.key();
        self.protocols
            .get(&key)
            .ok_or(ClassifyError::ProtocolNotFound(key))
    }

    /// Resolve both the protocol and its capability for a stored entry
    pub fn resolve_entry(
        &self,
        entry: &Entry,
    ) -> Result<(Protocol, Arc<dyn ProtocolCapability>), ClassifyError> {
        let protocol = self.protocol(&entry.protocol)?.clone();
        let capability = self.resolve(&protocol.name)?;
        Ok((protocol, capability))
    }

    /// First capability, in priority order, whose protocols listen on `port`
    pub fn claim(&self, port: &str) -> Option<Arc<dyn ProtocolCapability>> {
        self.capabilities
            .iter()
            .find(|c| c.protocols().iter().any(|p| p.ports.iter().any(|x| x == port)))
            .cloned()
    }

    /// Capabilities in priority order
    pub fn capabilities(&self) -> &[Arc<dyn ProtocolCapability>] {
        &self.capabilities
    }

    /// All macros of all capabilities, in priority order
    pub fn macros(&self) -> Vec<(String, String)> {
        self.capabilities.iter().flat_map(|c| c.macros()).collect()
    }

    /// Summarize a stored entry through its own capability
    pub fn summarize(&self, entry: &Entry) -> Result<Summary, ClassifyError> {
        let (_, capability) = self.resolve_entry(entry)?;
        capability.summarize(entry)
    }

    /// Build the full detail view of a stored entry
    pub fn wrap(&self, entry: Entry) -> Result<EntryWrapper, ClassifyError> {
        let (protocol, capability) = self.resolve_entry(&entry)?;
        let base = capability.summarize(&entry)?;
        let representation = capability.represent(&entry.request, &entry.response)?;

        Ok(EntryWrapper {
            protocol,
            representation: String::from_utf8_lossy(&representation).into_owned(),
            data: entry,
            base,
        })
    }
}

/// One row of a table section in a representation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct RepresentationRow {
    pub name: String,
    pub value: Value,
    pub selector: String,
}

/// A titled block of a representation (either a table or a body)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Section {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub data: String,
}

impl Section {
    pub fn table(title: &str, rows: &[RepresentationRow]) -> Self {
        Self {
            kind: "table".to_string(),
            title: title.to_string(),
            data: serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string()),
        }
    }

    pub fn body(title: &str, body: &str) -> Self {
        Self {
            kind: "body".to_string(),
            title: title.to_string(),
            data: body.to_string(),
        }
    }
}

/// Serialize request/response sections into the representation document
pub(crate) fn render_sections(
    protocol: &str,
    request: Vec<Section>,
    response: Vec<Section>,
) -> Result<Vec<u8>, ClassifyError> {
    serde_json::to_vec(&serde_json::json!({
        "request": request,
        "response": response,
    }))
    .map_err(|e| ClassifyError::Represent {
        protocol: protocol.to_string(),
        reason: e.to_string(),
    })
}
