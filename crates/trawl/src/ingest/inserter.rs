use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::entry::Entry;
use crate::store::{Mode, StoreConnection, StoreDialer, StoreError};

/// Why one `insert` call did not store its entry
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("cannot serialize entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("entry was not stored: {0}")]
    Send(#[source] StoreError),
}

/// Process-wide insertion pipeline.
///
/// Holds at most one insert-mode connection. The connection slot is guarded
/// by an async mutex held across both the reconnect step and the send, so
/// concurrent callers are serialized and never observe a half-built link.
/// Construct once at startup and share it by `Arc`.
pub struct EntryInserter {
    dialer: Arc<dyn StoreDialer>,
    reconnect_interval: Duration,
    connection: Mutex<Option<Box<dyn StoreConnection>>>,
}

impl EntryInserter {
    pub fn new(dialer: Arc<dyn StoreDialer>, reconnect_interval: Duration) -> Self {
        Self {
            dialer,
            reconnect_interval,
            connection: Mutex::new(None),
        }
    }

    /// Store one entry.
    ///
    /// Blocks until an insert connection exists, retrying the store forever.
    /// The entry is sent at most once; on a send failure the connection is
    /// discarded so the next call re-dials, and the failure is returned for
    /// this entry only.
    pub async fn insert(&self, entry: &Entry) -> Result<(), InsertError> {
        let raw = serde_json::to_vec(entry)?;

        let mut slot = self.connection.lock().await;
        if slot.is_none() {
            *slot = Some(self.connect().await);
        }

        let sent = match slot.as_mut() {
            Some(connection) => connection.insert(&raw).await,
            None => Err(StoreError::Closed),
        };

        if let Err(e) = sent {
            warn!(error = %e, "Insert failed, dropping store connection");
            if let Some(mut broken) = slot.take() {
                broken.close().await;
            }
            return Err(InsertError::Send(e));
        }
        Ok(())
    }

    /// Dial and negotiate insert mode, backing off between attempts until it
    /// succeeds.
    async fn connect(&self) -> Box<dyn StoreConnection> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.dialer.dial().await {
                Ok(mut connection) => match connection.set_mode(Mode::Insert).await {
                    Ok(()) => {
                        if attempt > 1 {
                            info!(attempt, "Insert connection re-established");
                        } else {
                            debug!("Insert connection established");
                        }
                        return connection;
                    }
                    Err(e) => {
                        error!(attempt, error = %e, retry_in = ?self.reconnect_interval, "Store refused insert mode");
                        connection.close().await;
                    }
                },
                Err(e) => {
                    error!(attempt, error = %e, retry_in = ?self.reconnect_interval, "Cannot reach entry store");
                }
            }
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    /// Whether a live insert connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Release the connection, if any
    pub async fn close(&self) {
        if let Some(mut connection) = self.connection.lock().await.take() {
            connection.close().await;
        }
    }
}
