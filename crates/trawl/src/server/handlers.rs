use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use super::{AppState, create_error_response};
use crate::entries::{EntriesError, EntriesRequest};
use crate::entry::CaptureItem;
use crate::replay::ReplayRequest;
use crate::store::{Mode, StoreError};

#[derive(Debug, Default, Deserialize)]
pub struct SingleEntryParams {
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateResponse {
    pub valid: bool,
    pub message: String,
}

/// Run a handler body under the REST request timeout
async fn bounded<F>(state: &AppState, work: F) -> Response<Body>
where
    F: Future<Output = Response<Body>>,
{
    match tokio::time::timeout(state.request_timeout(), work).await {
        Ok(response) => response,
        Err(_) => create_error_response(StatusCode::GATEWAY_TIMEOUT, "store did not answer in time"),
    }
}

fn entries_error_response(e: &EntriesError) -> Response<Body> {
    if e.is_invalid_query() {
        return create_error_response(StatusCode::BAD_REQUEST, &e.to_string());
    }
    let status = match e {
        EntriesError::Store(StoreError::Connect { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        EntriesError::Store(StoreError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    create_error_response(status, &e.to_string())
}

/// `GET /entries`
pub async fn get_entries(
    State(state): State<Arc<AppState>>,
    Query(request): Query<EntriesRequest>,
) -> Response<Body> {
    bounded(&state, async {
        match state.entries.get_entries(&request).await {
            Ok(page) => Json(page).into_response(),
            Err(e) => {
                tracing::error!(query = %request.query, error = %e, "Failed to get entries");
                entries_error_response(&e)
            }
        }
    })
    .await
}

/// `GET /entries/{id}`
pub async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<SingleEntryParams>,
) -> Response<Body> {
    bounded(&state, async {
        match state.entries.get_entry(&id, &params.query).await {
            Ok(wrapper) => Json(wrapper).into_response(),
            Err(e) => {
                tracing::error!(id = %id, error = %e, "Failed to get entry");
                entries_error_response(&e)
            }
        }
    })
    .await
}

/// `POST /entries`
pub async fn ingest_entry(
    State(state): State<Arc<AppState>>,
    Json(item): Json<CaptureItem>,
) -> Response<Body> {
    match state.ingestor.try_submit(item) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"accepted": true})),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Capture item refused");
            create_error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())
        }
    }
}

/// `POST /query/validate`
pub async fn validate_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidateRequest>,
) -> Response<Body> {
    bounded(&state, async {
        let mut connection = match state.dialer.dial().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reach store");
                return create_error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
            }
        };

        let checked = match connection.set_mode(Mode::Query).await {
            Ok(()) => connection.validate(&request.query).await,
            Err(e) => Err(e),
        };
        connection.close().await;

        match checked {
            Ok(()) => Json(ValidateResponse {
                valid: true,
                message: String::new(),
            })
            .into_response(),
            Err(StoreError::Validation(message)) => Json(ValidateResponse {
                valid: false,
                message,
            })
            .into_response(),
            Err(e) => {
                tracing::error!(query = %request.query, error = %e, "Validation failed");
                create_error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    })
    .await
}

/// `POST /replay`
///
/// Always 200; failures travel inside the body.
pub async fn replay(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReplayRequest>,
) -> Response<Body> {
    let timeout = state.config.replay.timeout();
    Json(state.replay.execute(request, timeout).await).into_response()
}
