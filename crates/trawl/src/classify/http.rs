//! HTTP capability
//!
//! Analyzes captured (or replayed) HTTP exchanges into entries whose request
//! and response objects follow a HAR-like layout, and renders them as
//! table/body sections for detail views.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use url::Url;

use super::{ClassifyError, Protocol, ProtocolCapability, RepresentationRow, Section, render_sections};
use crate::entry::{CaptureItem, Entry, Summary, Tcp};

const NAME: &str = "http";

/// Captured HTTP request payload as produced by the capture pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestPayload {
    pub method: String,
    pub url: String,
    #[serde(default = "default_http_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Captured HTTP response payload as produced by the capture pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponsePayload {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default = "default_http_version")]
    pub http_version: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_http_version() -> String {
    "HTTP/1.1".to_string()
}

/// HTTP/1.x and HTTP/2 capability
pub struct HttpCapability {
    protocols: Vec<Protocol>,
}

impl HttpCapability {
    pub fn new() -> Self {
        let protocol = |version: &str, abbr: &str, long_name: &str| Protocol {
            name: NAME.to_string(),
            long_name: long_name.to_string(),
            abbr: abbr.to_string(),
            macro_name: NAME.to_string(),
            version: version.to_string(),
            background_color: "#205cf5".to_string(),
            foreground_color: "#ffffff".to_string(),
            font_size: 12,
            reference_link: "https://datatracker.ietf.org/doc/html/rfc2616".to_string(),
            ports: vec!["80".to_string(), "443".to_string(), "8080".to_string()],
            priority: 0,
        };

        Self {
            protocols: vec![
                protocol("1.1", "HTTP", "Hypertext Transfer Protocol -- HTTP/1.1"),
                protocol("2.0", "HTTP/2", "Hypertext Transfer Protocol Version 2 (HTTP/2)"),
            ],
        }
    }

    fn analyze_error(reason: impl Into<String>) -> ClassifyError {
        ClassifyError::Analyze {
            protocol: NAME.to_string(),
            reason: reason.into(),
        }
    }

    fn represent_error(reason: impl Into<String>) -> ClassifyError {
        ClassifyError::Represent {
            protocol: NAME.to_string(),
            reason: reason.into(),
        }
    }
}

impl Default for HttpCapability {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a request URL into (host, path, query pairs), tolerating bare paths
fn split_url(raw: &str) -> (String, String, Vec<(String, String)>) {
    let parsed = Url::parse(raw).or_else(|_| Url::parse("http://localhost").and_then(|b| b.join(raw)));
    match parsed {
        Ok(url) => (
            url.host_str().unwrap_or_default().to_string(),
            url.path().to_string(),
            url.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        ),
        Err(_) => (String::new(), raw.to_string(), Vec::new()),
    }
}

fn name_value_list<'a>(pairs: impl Iterator<Item = (&'a String, &'a String)>) -> Value {
    Value::Array(
        pairs
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    )
}

fn str_field<'a>(object: &'a Map<String, Value>, field: &str) -> &'a str {
    object.get(field).and_then(Value::as_str).unwrap_or_default()
}

fn header_rows(object: &Map<String, Value>, side: &str) -> Vec<RepresentationRow> {
    object
        .get("headers")
        .and_then(Value::as_array)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| {
                    let name = h.get("name")?.as_str()?;
                    Some(RepresentationRow {
                        name: name.to_string(),
                        value: h.get("value").cloned().unwrap_or(Value::Null),
                        selector: format!("{side}.headers[\"{name}\"]"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn row(name: &str, value: Value, selector: &str) -> RepresentationRow {
    RepresentationRow {
        name: name.to_string(),
        value,
        selector: selector.to_string(),
    }
}

impl ProtocolCapability for HttpCapability {
    fn name(&self) -> &str {
        NAME
    }

    fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    fn macros(&self) -> Vec<(String, String)> {
        vec![(NAME.to_string(), format!("proto.name == \"{NAME}\""))]
    }

    fn analyze(&self, item: &CaptureItem) -> Result<Entry, ClassifyError> {
        let protocol = self.protocol_for(&item.protocol)?;
        let request: HttpRequestPayload =
            serde_json::from_value(item.pair.request.payload.clone())
                .map_err(|e| Self::analyze_error(format!("request payload: {e}")))?;
        let response: HttpResponsePayload =
            serde_json::from_value(item.pair.response.payload.clone())
                .map_err(|e| Self::analyze_error(format!("response payload: {e}")))?;

        let (host, path, query) = split_url(&request.url);

        let mut request_map = Map::new();
        request_map.insert("method".into(), json!(request.method.to_uppercase()));
        request_map.insert("url".into(), json!(request.url));
        request_map.insert("host".into(), json!(host));
        request_map.insert("path".into(), json!(path));
        request_map.insert("httpVersion".into(), json!(request.http_version));
        request_map.insert("headers".into(), name_value_list(request.headers.iter()));
        request_map.insert(
            "queryString".into(),
            Value::Array(
                query
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect(),
            ),
        );
        request_map.insert("body".into(), json!(request.body));
        request_map.insert("bodySize".into(), json!(request.body.len()));

        let mut response_map = Map::new();
        response_map.insert("status".into(), json!(response.status));
        response_map.insert("statusText".into(), json!(response.status_text));
        response_map.insert("httpVersion".into(), json!(response.http_version));
        response_map.insert("headers".into(), name_value_list(response.headers.iter()));
        response_map.insert("body".into(), json!(response.body));
        response_map.insert("bodySize".into(), json!(response.body.len()));

        let info = &item.connection_info;
        Ok(Entry {
            id: String::new(),
            protocol: protocol.summary(),
            capture: item.capture.clone(),
            src: Tcp {
                ip: info.client_ip.clone(),
                port: info.client_port.clone(),
                name: String::new(),
            },
            dst: Tcp {
                ip: info.server_ip.clone(),
                port: info.server_port.clone(),
                name: host,
            },
            outgoing: info.is_outgoing,
            timestamp: item.timestamp,
            start_time: item.pair.request.capture_time,
            request: request_map,
            response: response_map,
            request_size: item.pair.request.capture_size,
            response_size: item.pair.response.capture_size,
            elapsed_time: item.elapsed_ms(),
        })
    }

    fn summarize(&self, entry: &Entry) -> Result<Summary, ClassifyError> {
        let method = str_field(&entry.request, "method").to_string();
        let path = str_field(&entry.request, "path").to_string();
        let status = entry
            .response
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);

        Ok(Summary {
            id: entry.id.clone(),
            protocol: self.protocol_for(&entry.protocol)?,
            capture: entry.capture.clone(),
            summary_query: format!("request.path == \"{path}\""),
            summary: path,
            status,
            status_query: format!("response.status == {status}"),
            method_query: format!("request.method == \"{method}\""),
            method,
            timestamp: entry.timestamp,
            src: entry.src.clone(),
            dst: entry.dst.clone(),
            outgoing: entry.outgoing,
            latency: entry.elapsed_time,
        })
    }

    fn represent(
        &self,
        request: &Map<String, Value>,
        response: &Map<String, Value>,
    ) -> Result<Vec<u8>, ClassifyError> {
        let method = request
            .get("method")
            .ok_or_else(|| Self::represent_error("request has no method"))?;
        let status = response
            .get("status")
            .ok_or_else(|| Self::represent_error("response has no status"))?;

        let mut request_sections = vec![Section::table(
            "Details",
            &[
                row("Method", method.clone(), "request.method"),
                row("URL", json!(str_field(request, "url")), "request.url"),
                row("Path", json!(str_field(request, "path")), "request.path"),
                row(
                    "HTTP Version",
                    json!(str_field(request, "httpVersion")),
                    "request.httpVersion",
                ),
            ],
        )];
        request_sections.push(Section::table("Headers", &header_rows(request, "request")));

        let query_rows: Vec<RepresentationRow> = request
            .get("queryString")
            .and_then(Value::as_array)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter_map(|p| {
                        let name = p.get("name")?.as_str()?;
                        Some(row(
                            name,
                            p.get("value").cloned().unwrap_or(Value::Null),
                            &format!("request.queryString[\"{name}\"]"),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !query_rows.is_empty() {
            request_sections.push(Section::table("Query String", &query_rows));
        }

        let request_body = str_field(request, "body");
        if !request_body.is_empty() {
            request_sections.push(Section::body("Body", request_body));
        }

        let mut response_sections = vec![Section::table(
            "Details",
            &[
                row("Status", status.clone(), "response.status"),
                row(
                    "Status Text",
                    json!(str_field(response, "statusText")),
                    "response.statusText",
                ),
                row(
                    "HTTP Version",
                    json!(str_field(response, "httpVersion")),
                    "response.httpVersion",
                ),
            ],
        )];
        response_sections.push(Section::table("Headers", &header_rows(response, "response")));

        let response_body = str_field(response, "body");
        if !response_body.is_empty() {
            response_sections.push(Section::body("Body", response_body));
        }

        render_sections(NAME, request_sections, response_sections)
    }
}
