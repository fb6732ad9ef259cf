use reqwest::{Response, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use std::time::Duration;
use url::Url;

use trawl::entries::{EntriesPage, EntriesRequest};
use trawl::entry::EntryWrapper;
use trawl::replay::{ReplayRequest, ReplayResponse};

use crate::error::{CliError, CliResult};

/// Verdict of `POST /query/validate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(default)]
    pub message: String,
}

/// Thin client for the gateway's REST surface
pub struct GatewayClient {
    base: Url,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base: &str, timeout: Duration) -> CliResult<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, http })
    }

    fn endpoint(&self, path: &str) -> CliResult<Url> {
        Ok(self.base.join(path)?)
    }

    pub async fn entries(&self, request: &EntriesRequest) -> CliResult<EntriesPage> {
        let response = self
            .http
            .get(self.endpoint("entries")?)
            .query(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn entry(&self, id: &str, query: &str) -> CliResult<EntryWrapper> {
        let mut url = self.endpoint("entries/")?;
        url.path_segments_mut()
            .map_err(|_| CliError::from("gateway URL cannot carry a path"))?
            .pop_if_empty()
            .push(id);
        let response = self
            .http
            .get(url)
            .query(&[("query", query)])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn validate(&self, query: &str) -> CliResult<Validation> {
        let response = self
            .http
            .post(self.endpoint("query/validate")?)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn replay(&self, request: &ReplayRequest) -> CliResult<ReplayResponse> {
        let response = self
            .http
            .post(self.endpoint("replay")?)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }
}

/// Decode a success body, or turn the gateway's error body into a message
async fn decode<T: DeserializeOwned>(response: Response) -> CliResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(CliError(error_message(status, &body)))
}

fn error_message(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("msg").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    if detail.is_empty() {
        format!("Gateway returned {status}")
    } else {
        format!("Gateway returned {status}: {detail}")
    }
}
