//! Replay of captured HTTP transactions
//!
//! A replay re-issues a request against its original target, then feeds the
//! live request/response pair through the same analyze/summarize/represent
//! path captured traffic takes. At most `max_parallel` replays run at once
//! across the whole process; the rest are turned away immediately.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::{
    CapabilityRegistry, ClassifyError, HttpRequestPayload, HttpResponsePayload,
};
use crate::config::ReplayConfig;
use crate::entry::{
    CaptureItem, ConnectionInfo, Entry, EntryWrapper, GenericMessage, RequestResponsePair,
};

/// Header carrying the per-replay correlation id
pub const CORRELATION_HEADER: &str = "x-trawl-replay";

/// What to replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Outcome of a replay; failures are ordinary results, not errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    #[serde(rename = "status")]
    pub success: bool,
    pub data: Option<EntryWrapper>,
    pub error_message: String,
}

impl ReplayResponse {
    fn ok(wrapper: EntryWrapper) -> Self {
        Self {
            success: true,
            data: Some(wrapper),
            error_message: String::new(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error_message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
enum ReplayError {
    #[error("invalid HTTP method: {0}")]
    Method(String),

    #[error("invalid header {0}")]
    Header(String),

    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Classify(#[from] ClassifyError),

    #[error("{0}")]
    Encode(#[from] serde_json::Error),
}

/// Process-wide in-flight counter bounded by a ceiling
struct Admission {
    ceiling: usize,
    in_flight: Mutex<usize>,
}

impl Admission {
    fn count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(self: &Arc<Self>) -> Option<AdmissionSlot> {
        let mut in_flight = self.count();
        if *in_flight >= self.ceiling {
            return None;
        }
        *in_flight += 1;
        Some(AdmissionSlot {
            admission: Arc::clone(self),
        })
    }
}

/// Held for the duration of one replay; frees the slot on drop
struct AdmissionSlot {
    admission: Arc<Admission>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        let mut in_flight = self.admission.count();
        *in_flight = in_flight.saturating_sub(1);
    }
}

/// Executes replays under the global concurrency ceiling
#[derive(Clone)]
pub struct ReplayExecutor {
    client: reqwest::Client,
    registry: Arc<CapabilityRegistry>,
    admission: Arc<Admission>,
}

impl ReplayExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, config: &ReplayConfig) -> Self {
        Self::with_client(reqwest::Client::new(), registry, config)
    }

    pub fn with_client(
        client: reqwest::Client,
        registry: Arc<CapabilityRegistry>,
        config: &ReplayConfig,
    ) -> Self {
        Self {
            client,
            registry,
            admission: Arc::new(Admission {
                ceiling: config.max_parallel,
                in_flight: Mutex::new(0),
            }),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.admission.ceiling
    }

    /// Replays currently admitted
    pub fn in_flight(&self) -> usize {
        *self.admission.count()
    }

    /// Run one replay, giving the target `timeout` to answer. Rejection,
    /// transport failure and classification failure all come back as an
    /// unsuccessful [`ReplayResponse`].
    pub async fn execute(&self, request: ReplayRequest, timeout: Duration) -> ReplayResponse {
        let Some(_slot) = self.admission.try_acquire() else {
            info!(ceiling = self.ceiling(), url = %request.url, "Replay rejected");
            return ReplayResponse::failed(format!(
                "reached threshold of {} requests",
                self.ceiling()
            ));
        };

        match self.perform(&request, timeout).await {
            Ok(wrapper) => ReplayResponse::ok(wrapper),
            Err(e) => {
                warn!(method = %request.method, url = %request.url, error = %e, "Replay failed");
                ReplayResponse::failed(e.to_string())
            }
        }
    }

    async fn perform(
        &self,
        replay: &ReplayRequest,
        timeout: Duration,
    ) -> Result<EntryWrapper, ReplayError> {
        let method_name = replay.method.to_uppercase();
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ReplayError::Method(replay.method.clone()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &replay.headers {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ReplayError::Header(name.clone()))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| ReplayError::Header(name.clone()))?;
            headers.append(header_name, header_value);
        }

        let correlation = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&correlation) {
            headers.insert(CORRELATION_HEADER, value);
        }

        let sent_at = Utc::now();
        let response = self
            .client
            .request(method, replay.url.as_str())
            .headers(headers.clone())
            .body(replay.body.clone())
            .timeout(timeout)
            .send()
            .await?;
        let received_at = Utc::now();

        let status = response.status();
        let http_version = format!("{:?}", response.version());
        let response_headers = flatten_headers(response.headers());
        let response_body = response.text().await?;

        debug!(correlation = %correlation, status = status.as_u16(), "Replay answered");

        let capability = self.registry.resolve("http")?;
        let protocol = capability
            .protocols()
            .first()
            .map(|p| p.summary())
            .ok_or_else(|| ClassifyError::NotFound("http".to_string()))?;

        let request_payload = HttpRequestPayload {
            method: method_name,
            url: replay.url.clone(),
            http_version: http_version.clone(),
            headers: flatten_headers(&headers),
            body: replay.body.clone(),
        };
        let response_payload = HttpResponsePayload {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            http_version,
            headers: response_headers,
            body: response_body,
        };

        let captured = CaptureItem {
            protocol,
            connection_info: ConnectionInfo {
                client_ip: String::new(),
                client_port: "1".to_string(),
                server_ip: String::new(),
                server_port: "1".to_string(),
                is_outgoing: false,
            },
            capture: String::new(),
            timestamp: sent_at.timestamp_millis(),
            pair: RequestResponsePair {
                request: GenericMessage {
                    is_request: true,
                    capture_time: sent_at,
                    capture_size: 0,
                    payload: serde_json::to_value(&request_payload)?,
                },
                response: GenericMessage {
                    is_request: false,
                    capture_time: received_at,
                    capture_size: 0,
                    payload: serde_json::to_value(&response_payload)?,
                },
            },
        };

        // same wire form as items arriving from capture
        let item: CaptureItem = serde_json::from_slice(&serde_json::to_vec(&captured)?)?;
        let analyzed = capability.analyze(&item)?;
        let entry: Entry = serde_json::from_slice(&serde_json::to_vec(&analyzed)?)?;

        Ok(self.registry.wrap(entry)?)
    }
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(max_parallel: usize) -> ReplayExecutor {
        ReplayExecutor::new(
            Arc::new(CapabilityRegistry::with_defaults()),
            &ReplayConfig {
                max_parallel,
                timeout_secs: 1,
            },
        )
    }

    #[test]
    fn test_admission_is_bounded_and_released_on_drop() {
        let executor = executor(2);
        let first = executor.admission.try_acquire();
        let second = executor.admission.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert!(executor.admission.try_acquire().is_none());
        assert_eq!(executor.in_flight(), 2);

        drop(first);
        assert_eq!(executor.in_flight(), 1);
        assert!(executor.admission.try_acquire().is_some());
        drop(second);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_zero_ceiling_rejects_everything() {
        let executor = executor(0);
        let response = executor
            .execute(
                ReplayRequest {
                    method: "GET".to_string(),
                    url: "http://127.0.0.1:1/".to_string(),
                    body: String::new(),
                    headers: BTreeMap::new(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(!response.success);
        assert_eq!(response.error_message, "reached threshold of 0 requests");
    }

    #[tokio::test]
    async fn test_invalid_method_is_a_failed_result() {
        let executor = executor(5);
        let response = executor
            .execute(
                ReplayRequest {
                    method: "NOT A METHOD".to_string(),
                    url: "http://127.0.0.1:1/".to_string(),
                    body: String::new(),
                    headers: BTreeMap::new(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(!response.success);
        assert!(response.error_message.contains("invalid HTTP method"));
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn test_flatten_joins_repeated_headers() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append("set-cookie", "a=1".parse().unwrap());
        headers.append("set-cookie", "b=2".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());

        let flat = flatten_headers(&headers);
        assert_eq!(flat["set-cookie"], "a=1, b=2");
        assert_eq!(flat["content-type"], "text/plain");
    }

    #[test]
    fn test_response_wire_names() {
        let json = serde_json::to_value(ReplayResponse::failed("boom")).unwrap();
        assert_eq!(json["status"], false);
        assert_eq!(json["errorMessage"], "boom");
        assert!(json["data"].is_null());
    }
}
