use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::EntryInserter;
use crate::classify::CapabilityRegistry;
use crate::entry::CaptureItem;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("ingest queue is full")]
    QueueFull,

    #[error("ingest worker has stopped")]
    Closed,
}

/// Counters reported by the worker when its queue closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: u64,
    pub unclassified: u64,
    pub failed: u64,
}

/// Front of the capture ingestion queue.
///
/// Items are analyzed by the capability registered for their protocol and
/// handed to the [`EntryInserter`]. Anything that cannot be classified or
/// stored is logged and dropped; the worker never stops on a bad item.
#[derive(Clone)]
pub struct Ingestor {
    sender: mpsc::Sender<CaptureItem>,
}

impl Ingestor {
    /// Start the worker. It runs until every `Ingestor` clone is dropped.
    pub fn spawn(
        registry: Arc<CapabilityRegistry>,
        inserter: Arc<EntryInserter>,
        queue_depth: usize,
    ) -> (Self, JoinHandle<IngestStats>) {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let handle = tokio::spawn(run_worker(registry, inserter, receiver));
        (Self { sender }, handle)
    }

    /// Enqueue without waiting; fails when the queue is full
    pub fn try_submit(&self, item: CaptureItem) -> Result<(), IngestError> {
        self.sender.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })
    }

    /// Enqueue, waiting for room
    pub async fn submit(&self, item: CaptureItem) -> Result<(), IngestError> {
        self.sender.send(item).await.map_err(|_| IngestError::Closed)
    }
}

async fn run_worker(
    registry: Arc<CapabilityRegistry>,
    inserter: Arc<EntryInserter>,
    mut receiver: mpsc::Receiver<CaptureItem>,
) -> IngestStats {
    let mut stats = IngestStats::default();

    while let Some(item) = receiver.recv().await {
        let entry = match registry
            .resolve(&item.protocol.name)
            .and_then(|capability| capability.analyze(&item))
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(protocol = %item.protocol.key(), error = %e, "Dropping capture item");
                stats.unclassified += 1;
                continue;
            }
        };

        match inserter.insert(&entry).await {
            Ok(()) => {
                stats.inserted += 1;
                debug!(protocol = %entry.protocol.key(), "Entry inserted");
            }
            Err(e) => {
                warn!(protocol = %entry.protocol.key(), error = %e, "Dropping entry");
                stats.failed += 1;
            }
        }
    }

    info!(
        inserted = stats.inserted,
        unclassified = stats.unclassified,
        failed = stats.failed,
        "Ingest worker stopped"
    );
    stats
}
