//! Entry model shared by the store client, the classifier and the gateway surface

pub mod types;

pub use types::{
    CaptureItem, ConnectionInfo, Entry, EntryWrapper, GenericMessage, Metadata, ProtocolSummary,
    RequestResponsePair, Summary, Tcp,
};
