use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{DeliveryError, StreamError, StreamParams, StreamState, SubscriberId, SubscriberTransport};
use crate::entry::{Entry, Metadata};
use crate::store::{
    Direction, FetchBatch, FetchRequest, LiveFeeds, Mode, StoreConnection, StoreDialer, StoreError,
};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Resolves once `cancel` reads `true` or its sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Drives one subscriber's stream from validation to teardown.
///
/// The controller owns its store connection exclusively; it is consumed by
/// [`StreamController::run`], which returns only once the connection has
/// been released and both live listeners have exited.
pub struct StreamController {
    subscriber: SubscriberId,
    dialer: Arc<dyn StoreDialer>,
    transport: Arc<dyn SubscriberTransport>,
    feed_buffer: usize,
    default_fetch_timeout: Duration,
    state: watch::Sender<StreamState>,
}

impl StreamController {
    pub fn new(
        subscriber: SubscriberId,
        dialer: Arc<dyn StoreDialer>,
        transport: Arc<dyn SubscriberTransport>,
        feed_buffer: usize,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Validating);
        Self {
            subscriber,
            dialer,
            transport,
            feed_buffer: feed_buffer.max(1),
            default_fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            state,
        }
    }

    /// Fetch timeout used when the subscriber does not send one
    pub fn with_default_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.default_fetch_timeout = timeout;
        self
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    /// Observe the controller's state transitions
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    fn enter(&self, state: StreamState) {
        self.state.send_replace(state);
        debug!(subscriber = %self.subscriber, state = ?state, "Stream state changed");
    }

    async fn open(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        let mut connection = self.dialer.dial().await?;
        if let Err(e) = connection.set_mode(Mode::Query).await {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    async fn fail(
        &self,
        connection: Option<&mut Box<dyn StoreConnection>>,
        error: StreamError,
    ) -> Result<(), StreamError> {
        warn!(subscriber = %self.subscriber, error = %error, "Stream failed");
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.transport.cleanup_socket(self.subscriber).await;
        self.enter(StreamState::Errored);
        Err(error)
    }

    async fn finish_cancelled(&self, connection: Option<&mut Box<dyn StoreConnection>>) -> Result<(), StreamError> {
        if let Some(connection) = connection {
            connection.close().await;
        }
        info!(subscriber = %self.subscriber, "Stream cancelled");
        self.enter(StreamState::Closed);
        Ok(())
    }

    /// Run the subscription until `cancel` fires (or its sender is dropped),
    /// the store link fails, or setup fails.
    ///
    /// Cancellation is a normal end and yields `Ok(())` with the state at
    /// [`StreamState::Closed`]; every other end leaves it at
    /// [`StreamState::Errored`].
    pub async fn run(
        self,
        params: StreamParams,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        self.enter(StreamState::Validating);

        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return self.finish_cancelled(None).await,
            opened = self.open() => opened,
        };
        let mut connection = match opened {
            Ok(connection) => connection,
            Err(e) => return self.fail(None, StreamError::Open(e)).await,
        };

        let validated = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return self.finish_cancelled(Some(&mut connection)).await,
            validated = connection.validate(&params.query) => validated,
        };
        match validated {
            Ok(()) => {}
            Err(StoreError::Validation(message)) => {
                if let Err(e) = self
                    .transport
                    .send_toast_error(self.subscriber, &message)
                    .await
                {
                    debug!(subscriber = %self.subscriber, error = %e, "Could not deliver validation error");
                }
                return self
                    .fail(Some(&mut connection), StreamError::InvalidQuery(message))
                    .await;
            }
            Err(e) => return self.fail(Some(&mut connection), StreamError::Validate(e)).await,
        }

        let mut cursor = params.left_off.clone();
        if params.fetch > 0 {
            self.enter(StreamState::Fetching);
            let request = FetchRequest {
                left_off: params.left_off.clone(),
                direction: params.direction,
                query: params.query.clone(),
                limit: params.fetch,
            };
            let timeout = params.fetch_timeout(self.default_fetch_timeout);

            let fetched = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return self.finish_cancelled(Some(&mut connection)).await,
                fetched = connection.fetch(&request, timeout) => fetched,
            };

            match fetched {
                Ok(batch) => {
                    let delivered = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => return self.finish_cancelled(Some(&mut connection)).await,
                        delivered = self.replay_batch(&params, batch) => delivered,
                    };
                    match delivered {
                        Ok(Some(resume)) => cursor = resume,
                        Ok(None) => {}
                        Err(e) => return self.fail(Some(&mut connection), e.into()).await,
                    }
                }
                Err(e) => {
                    // only a store-side rejection leaves the link in sync for the live phase
                    warn!(subscriber = %self.subscriber, cursor = %cursor, error = %e, "Historical fetch failed, going live from the subscriber cursor");
                    if !matches!(e, StoreError::Fetch(_)) {
                        connection.close().await;
                        connection = tokio::select! {
                            biased;
                            _ = cancelled(&mut cancel) => return self.finish_cancelled(None).await,
                            reopened = self.open() => match reopened {
                                Ok(connection) => connection,
                                Err(e) => return self.fail(None, StreamError::Open(e)).await,
                            },
                        };
                    }
                }
            }
        }

        self.live(params, cursor, connection, cancel).await
    }

    /// Send the position marker then the batch oldest-first. Returns the
    /// resume cursor, or `None` when it cannot be determined.
    async fn replay_batch(
        &self,
        params: &StreamParams,
        batch: FetchBatch,
    ) -> Result<Option<String>, DeliveryError> {
        // resume after the newest fetched item, mark the oldest
        let (resume_meta, marker_meta) = match params.direction {
            Direction::Backward => (&batch.first_meta, &batch.last_meta),
            Direction::Forward => (&batch.last_meta, &batch.first_meta),
        };

        let resume = match serde_json::from_slice::<Metadata>(resume_meta) {
            Ok(meta) => Some(meta.left_off),
            Err(e) => {
                warn!(subscriber = %self.subscriber, error = %e, "Undecodable fetch metadata, keeping subscriber cursor");
                None
            }
        };

        match serde_json::from_slice::<Metadata>(marker_meta) {
            Ok(marker) => self.transport.send_metadata(self.subscriber, &marker).await?,
            Err(e) => {
                debug!(subscriber = %self.subscriber, error = %e, "Skipping undecodable position marker")
            }
        }

        let ordered: Vec<&Bytes> = match params.direction {
            Direction::Backward => batch.entries.iter().rev().collect(),
            Direction::Forward => batch.entries.iter().collect(),
        };

        let mut delivered = 0usize;
        for raw in ordered {
            match serde_json::from_slice::<Entry>(raw) {
                Ok(entry) => {
                    self.transport
                        .send_entry(self.subscriber, &entry, params)
                        .await?;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(subscriber = %self.subscriber, error = %e, "Skipping undecodable fetched entry")
                }
            }
        }

        debug!(subscriber = %self.subscriber, delivered, fetched = batch.entries.len(), "Historical batch replayed");
        Ok(resume)
    }

    async fn live(
        self,
        params: StreamParams,
        cursor: String,
        mut connection: Box<dyn StoreConnection>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        self.enter(StreamState::Live);

        let (data_tx, data_rx) = mpsc::channel(self.feed_buffer);
        let (meta_tx, meta_rx) = mpsc::channel(self.feed_buffer);
        let feeds = LiveFeeds {
            data: data_tx,
            meta: meta_tx,
        };

        let attached = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return self.finish_cancelled(Some(&mut connection)).await,
            attached = connection.live_query(&cursor, &params.query, feeds) => attached,
        };
        if let Err(e) = attached {
            return self.fail(Some(&mut connection), StreamError::Live(e)).await;
        }
        info!(subscriber = %self.subscriber, cursor = %cursor, query = %params.query, "Live stream attached");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut listeners = JoinSet::new();
        listeners.spawn(listen_entries(
            self.subscriber,
            Arc::clone(&self.transport),
            params,
            data_rx,
            stop_rx.clone(),
        ));
        listeners.spawn(listen_metadata(
            self.subscriber,
            Arc::clone(&self.transport),
            meta_rx,
            stop_rx,
        ));

        let was_cancelled = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => true,
            _ = async { while listeners.join_next().await.is_some() {} } => false,
        };

        let _ = stop_tx.send(true);
        connection.close().await;
        while let Some(joined) = listeners.join_next().await {
            if let Err(e) = joined {
                warn!(subscriber = %self.subscriber, error = %e, "Listener task failed");
            }
        }

        if was_cancelled {
            info!(subscriber = %self.subscriber, "Stream cancelled");
            self.enter(StreamState::Closed);
            Ok(())
        } else {
            self.fail(None, StreamError::FeedsEnded).await
        }
    }
}

async fn listen_entries(
    subscriber: SubscriberId,
    transport: Arc<dyn SubscriberTransport>,
    params: StreamParams,
    mut feed: mpsc::Receiver<Bytes>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => break,
            raw = feed.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let entry: Entry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(subscriber = %subscriber, error = %e, "Skipping undecodable live entry");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => break,
            sent = transport.send_entry(subscriber, &entry, &params) => sent,
        };
        if let Err(e) = sent {
            debug!(subscriber = %subscriber, error = %e, "Entry listener stopping");
            break;
        }
    }
    debug!(subscriber = %subscriber, "Entry listener exited");
}

async fn listen_metadata(
    subscriber: SubscriberId,
    transport: Arc<dyn SubscriberTransport>,
    mut feed: mpsc::Receiver<Bytes>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => break,
            raw = feed.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let metadata: Metadata = match serde_json::from_slice(&raw) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(subscriber = %subscriber, error = %e, "Skipping undecodable live metadata");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = cancelled(&mut stop) => break,
            sent = transport.send_metadata(subscriber, &metadata) => sent,
        };
        if let Err(e) = sent {
            debug!(subscriber = %subscriber, error = %e, "Metadata listener stopping");
            break;
        }
    }
    debug!(subscriber = %subscriber, "Metadata listener exited");
}
