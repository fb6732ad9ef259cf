//! HTTP and WebSocket front of the gateway
//!
//! Routes:
//! - `GET  /health`            liveness probe
//! - `GET  /entries`           one page of entry summaries
//! - `GET  /entries/{id}`      full detail view of one entry
//! - `POST /entries`           enqueue a captured item for ingestion
//! - `POST /query/validate`    check a filter expression against the store
//! - `POST /replay`            re-issue a captured HTTP request
//! - `GET  /ws`                subscriber socket for live streaming

mod handlers;
mod socket;

pub use socket::SocketHub;

use axum::{
    Json, Router,
    body::Body,
    http::StatusCode,
    response::Response,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

use crate::classify::CapabilityRegistry;
use crate::config::Config;
use crate::entries::EntriesProvider;
use crate::error::{Result, TrawlError};
use crate::ingest::{EntryInserter, Ingestor};
use crate::replay::ReplayExecutor;
use crate::store::StoreDialer;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<CapabilityRegistry>,
    pub dialer: Arc<dyn StoreDialer>,
    pub entries: Arc<EntriesProvider>,
    pub ingestor: Ingestor,
    pub replay: ReplayExecutor,
    pub hub: Arc<SocketHub>,
}

impl AppState {
    /// Wire every service around one dialer and registry.
    ///
    /// Spawns the ingest worker, so this must run inside a tokio runtime.
    pub fn new(
        config: Config,
        dialer: Arc<dyn StoreDialer>,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        let entries = Arc::new(EntriesProvider::new(
            Arc::clone(&dialer),
            Arc::clone(&registry),
            Duration::from_millis(config.stream.default_fetch_timeout_ms),
        ));
        let inserter = Arc::new(EntryInserter::new(
            Arc::clone(&dialer),
            config.store.reconnect_interval(),
        ));
        let (ingestor, _worker) = Ingestor::spawn(
            Arc::clone(&registry),
            inserter,
            config.ingest.queue_depth,
        );
        let replay = ReplayExecutor::new(Arc::clone(&registry), &config.replay);
        let hub = Arc::new(SocketHub::new(Arc::clone(&registry)));

        Self {
            config,
            registry,
            dialer,
            entries,
            ingestor,
            replay,
            hub,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.timeout_secs)
    }
}

/// The gateway server
pub struct TrawlServer {
    state: Arc<AppState>,
}

impl TrawlServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Bind the listen address and serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .state
            .config
            .server
            .listen_addr
            .parse()
            .map_err(|e| TrawlError::Config(format!("Invalid listen address: {e}")))?;

        let app = create_router(Arc::clone(&self.state));

        tracing::info!("Starting gateway on {addr}");
        tracing::info!(
            "Replay ceiling: {} concurrent requests",
            self.state.replay.ceiling()
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrawlError::Server(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| TrawlError::Server(format!("Server error: {e}")))?;

        tracing::info!("Gateway shut down gracefully");
        Ok(())
    }
}

/// Create the router with all routes configured
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/entries",
            get(handlers::get_entries).post(handlers::ingest_entry),
        )
        .route("/entries/{id}", get(handlers::get_entry))
        .route("/query/validate", post(handlers::validate_query))
        .route("/replay", post(handlers::replay))
        .route("/ws", get(socket::ws_handler))
        .with_state(state)
}

/// Health check endpoint
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Error body in the shape the UI toasts: `{"error": true, "type": "error",
/// "autoClose": "5000", "msg": ...}`
fn create_error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": true,
        "type": "error",
        "autoClose": "5000",
        "msg": message,
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
