//! Capture ingestion
//!
//! Captured items flow through the [`Ingestor`] queue, get analyzed into
//! entries by the classifier, and are written to the store by the shared
//! [`EntryInserter`].

mod inserter;
mod worker;

pub use inserter::{EntryInserter, InsertError};
pub use worker::{IngestError, IngestStats, Ingestor};
