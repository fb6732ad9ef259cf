//! Subscriber sockets
//!
//! Every text frame a client sends is a [`StreamParams`] document that
//! (re)starts that socket's stream. Outbound frames are JSON objects tagged
//! by `messageType`:
//!
//! ```json
//! {"messageType": "entry", "data": {...summary...}}
//! {"messageType": "fullEntry", "data": {...entry wrapper...}}
//! {"messageType": "queryMetadata", "data": {...metadata...}}
//! {"messageType": "toast", "data": {"type": "error", "autoClose": 5000, "text": "..."}}
//! ```

use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::AppState;
use crate::classify::CapabilityRegistry;
use crate::entry::{Entry, Metadata};
use crate::stream::{
    DeliveryError, StreamController, StreamParams, SubscriberId, SubscriberTransport,
};

/// Outbound frames buffered per socket
const OUTBOUND_BUFFER: usize = 1024;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    message_type: &'a str,
    data: Value,
}

/// Registry of connected subscriber sockets; the gateway's
/// [`SubscriberTransport`].
pub struct SocketHub {
    registry: Arc<CapabilityRegistry>,
    next_id: AtomicU64,
    sockets: DashMap<SubscriberId, mpsc::Sender<Message>>,
}

impl SocketHub {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            next_id: AtomicU64::new(1),
            sockets: DashMap::new(),
        }
    }

    /// Register a socket; frames for it arrive on the returned receiver
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<Message>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(OUTBOUND_BUFFER);
        self.sockets.insert(id, sender);
        (id, receiver)
    }

    /// Forget a socket without sending anything
    pub fn remove(&self, id: SubscriberId) {
        self.sockets.remove(&id);
    }

    pub fn connected(&self) -> usize {
        self.sockets.len()
    }

    async fn deliver(
        &self,
        subscriber: SubscriberId,
        message_type: &str,
        data: Value,
    ) -> Result<(), DeliveryError> {
        let text = serde_json::to_string(&Envelope { message_type, data }).map_err(|e| {
            DeliveryError::Failed {
                subscriber,
                reason: e.to_string(),
            }
        })?;

        // clone out of the map so no shard lock is held across the await
        let sender = self
            .sockets
            .get(&subscriber)
            .map(|s| s.clone())
            .ok_or(DeliveryError::Gone(subscriber))?;

        sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| DeliveryError::Gone(subscriber))
    }
}

#[async_trait]
impl SubscriberTransport for SocketHub {
    async fn send_entry(
        &self,
        subscriber: SubscriberId,
        entry: &Entry,
        params: &StreamParams,
    ) -> Result<(), DeliveryError> {
        let classified = if params.enable_full_entries {
            self.registry
                .wrap(entry.clone())
                .and_then(|w| serde_json::to_value(w).map_err(|e| classify_encode(e, entry)))
                .map(|v| ("fullEntry", v))
        } else {
            self.registry
                .summarize(entry)
                .and_then(|s| serde_json::to_value(s).map_err(|e| classify_encode(e, entry)))
                .map(|v| ("entry", v))
        };

        match classified {
            Ok((message_type, data)) => self.deliver(subscriber, message_type, data).await,
            Err(e) => {
                warn!(subscriber = %subscriber, entry = %entry.id, error = %e, "Cannot classify streamed entry, skipping");
                Ok(())
            }
        }
    }

    async fn send_metadata(
        &self,
        subscriber: SubscriberId,
        metadata: &Metadata,
    ) -> Result<(), DeliveryError> {
        let data = serde_json::to_value(metadata).map_err(|e| DeliveryError::Failed {
            subscriber,
            reason: e.to_string(),
        })?;
        self.deliver(subscriber, "queryMetadata", data).await
    }

    async fn send_toast_error(
        &self,
        subscriber: SubscriberId,
        message: &str,
    ) -> Result<(), DeliveryError> {
        let data = json!({"type": "error", "autoClose": 5000, "text": message});
        self.deliver(subscriber, "toast", data).await
    }

    async fn cleanup_socket(&self, subscriber: SubscriberId) {
        if let Some((_, sender)) = self.sockets.remove(&subscriber) {
            let _ = sender.send(Message::Close(None)).await;
            debug!(subscriber = %subscriber, "Socket cleaned up");
        }
    }
}

fn classify_encode(e: serde_json::Error, entry: &Entry) -> crate::classify::ClassifyError {
    crate::classify::ClassifyError::Represent {
        protocol: entry.protocol.name.clone(),
        reason: e.to_string(),
    }
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct RunningStream {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningStream {
    async fn stop(self) {
        let _ = self.cancel.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Stream task failed");
        }
    }
}

fn start_stream(state: &Arc<AppState>, id: SubscriberId, params: StreamParams) -> RunningStream {
    let transport: Arc<dyn SubscriberTransport> = state.hub.clone();
    let controller = StreamController::new(
        id,
        Arc::clone(&state.dialer),
        transport,
        state.config.stream.feed_buffer,
    )
    .with_default_fetch_timeout(std::time::Duration::from_millis(
        state.config.stream.default_fetch_timeout_ms,
    ));

    let (cancel, cancel_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        if let Err(e) = controller.run(params, cancel_rx).await {
            debug!(subscriber = %id, error = %e, "Stream ended with error");
        }
    });
    RunningStream { cancel, handle }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (id, mut outbound) = state.hub.register();
    info!(subscriber = %id, "Subscriber connected");

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut running: Option<RunningStream> = None;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<StreamParams>(text.as_str()) {
                        Ok(params) => {
                            if let Some(previous) = running.take() {
                                previous.stop().await;
                            }
                            debug!(subscriber = %id, query = %params.query, fetch = params.fetch, "Starting stream");
                            running = Some(start_stream(&state, id, params));
                        }
                        Err(e) => {
                            let message = format!("invalid stream parameters: {e}");
                            if state.hub.send_toast_error(id, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "Socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    if let Some(stream) = running.take() {
        stream.stop().await;
    }
    state.hub.remove(id);
    writer.abort();
    info!(subscriber = %id, "Subscriber disconnected");
}
