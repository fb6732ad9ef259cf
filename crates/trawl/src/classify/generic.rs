//! Capability for message-oriented protocols (AMQP, Kafka, Redis)
//!
//! These protocols share one shape: the capture pipeline hands over a JSON
//! object per direction, one field names the operation and another the
//! object it acts on. The entry keeps both objects as-is.

use serde_json::{Map, Value};

use super::{ClassifyError, Protocol, ProtocolCapability, RepresentationRow, Section, render_sections};
use crate::entry::{CaptureItem, Entry, Summary, Tcp};

/// Field-driven capability shared by the message-oriented protocols
#[derive(Debug, Clone)]
pub struct GenericCapability {
    name: String,
    protocols: Vec<Protocol>,
    method_field: String,
    summary_field: String,
}

impl GenericCapability {
    #[allow(clippy::too_many_arguments)]
    fn build(
        name: &str,
        long_name: &str,
        abbr: &str,
        version: &str,
        background_color: &str,
        reference_link: &str,
        ports: &[&str],
        priority: u8,
        method_field: &str,
        summary_field: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            protocols: vec![Protocol {
                name: name.to_string(),
                long_name: long_name.to_string(),
                abbr: abbr.to_string(),
                macro_name: name.to_string(),
                version: version.to_string(),
                background_color: background_color.to_string(),
                foreground_color: "#ffffff".to_string(),
                font_size: 12,
                reference_link: reference_link.to_string(),
                ports: ports.iter().map(|p| p.to_string()).collect(),
                priority,
            }],
            method_field: method_field.to_string(),
            summary_field: summary_field.to_string(),
        }
    }

    pub fn amqp() -> Self {
        Self::build(
            "amqp",
            "Advanced Message Queuing Protocol 0-9-1",
            "AMQP",
            "0-9-1",
            "#ff6600",
            "https://www.rabbitmq.com/amqp-0-9-1-reference.html",
            &["5671", "5672"],
            1,
            "method",
            "queue",
        )
    }

    pub fn kafka() -> Self {
        Self::build(
            "kafka",
            "Apache Kafka Protocol",
            "KAFKA",
            "12",
            "#000000",
            "https://kafka.apache.org/protocol",
            &["9092"],
            2,
            "apiKey",
            "topic",
        )
    }

    pub fn redis() -> Self {
        Self::build(
            "redis",
            "Redis Serialization Protocol",
            "REDIS",
            "3.x",
            "#a41e11",
            "https://redis.io/topics/protocol",
            &["6379"],
            3,
            "command",
            "key",
        )
    }

    /// Additionally claim traffic on `port`
    pub fn claim_port(&mut self, port: &str) {
        for protocol in &mut self.protocols {
            if !protocol.ports.iter().any(|p| p == port) {
                protocol.ports.push(port.to_string());
            }
        }
    }

    fn payload_object(&self, side: &str, payload: &Value) -> Result<Map<String, Value>, ClassifyError> {
        match payload {
            Value::Object(object) => Ok(object.clone()),
            Value::Null if side == "response" => Ok(Map::new()),
            other => Err(ClassifyError::Analyze {
                protocol: self.name.clone(),
                reason: format!("{side} payload must be an object, got {}", kind(other)),
            }),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn scalar_rows(object: &Map<String, Value>, side: &str) -> Vec<RepresentationRow> {
    object
        .iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .filter(|(k, _)| k.as_str() != "body")
        .map(|(k, v)| RepresentationRow {
            name: k.clone(),
            value: v.clone(),
            selector: format!("{side}.{k}"),
        })
        .collect()
}

fn nested_sections(object: &Map<String, Value>) -> Vec<Section> {
    let mut sections = Vec::new();
    for (key, value) in object {
        match value {
            Value::Object(_) | Value::Array(_) => {
                sections.push(Section::body(key, &value.to_string()));
            }
            Value::String(body) if key == "body" && !body.is_empty() => {
                sections.push(Section::body("Body", body));
            }
            _ => {}
        }
    }
    sections
}

impl ProtocolCapability for GenericCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    fn macros(&self) -> Vec<(String, String)> {
        vec![(self.name.clone(), format!("proto.name == \"{}\"", self.name))]
    }

    fn analyze(&self, item: &CaptureItem) -> Result<Entry, ClassifyError> {
        let protocol = self.protocol_for(&item.protocol)?;
        let request = self.payload_object("request", &item.pair.request.payload)?;
        let response = self.payload_object("response", &item.pair.response.payload)?;

        if !request.contains_key(&self.method_field) {
            return Err(ClassifyError::Analyze {
                protocol: self.name.clone(),
                reason: format!("request payload has no `{}`", self.method_field),
            });
        }

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
                name: String::new(),
            },
            outgoing: info.is_outgoing,
            timestamp: item.timestamp,
            start_time: item.pair.request.capture_time,
            request,
            response,
            request_size: item.pair.request.capture_size,
            response_size: item.pair.response.capture_size,
            elapsed_time: item.elapsed_ms(),
        })
    }

    fn summarize(&self, entry: &Entry) -> Result<Summary, ClassifyError> {
        let method = text(entry.request.get(&self.method_field));
        let summary = text(entry.request.get(&self.summary_field));

        Ok(Summary {
            id: entry.id.clone(),
            protocol: self.protocol_for(&entry.protocol)?,
            capture: entry.capture.clone(),
            summary_query: format!("request.{} == \"{summary}\"", self.summary_field),
            summary,
            status: 0,
            status_query: String::new(),
            method_query: format!("request.{} == \"{method}\"", self.method_field),
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
        if !request.contains_key(&self.method_field) {
            return Err(ClassifyError::Represent {
                protocol: self.name.clone(),
                reason: format!("request has no `{}`", self.method_field),
            });
        }

        let mut request_sections = vec![Section::table("Details", &scalar_rows(request, "request"))];
        request_sections.extend(nested_sections(request));

        let mut response_sections = Vec::new();
        if !response.is_empty() {
            response_sections.push(Section::table("Details", &scalar_rows(response, "response")));
            response_sections.extend(nested_sections(response));
        }

        render_sections(&self.name, request_sections, response_sections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::entry::{ConnectionInfo, GenericMessage, ProtocolSummary, RequestResponsePair};
    use chrono::Utc;

    fn redis_item(request: Value, response: Value) -> CaptureItem {
        let now = Utc::now();
        CaptureItem {
            protocol: ProtocolSummary {
                name: "redis".to_string(),
                version: "3.x".to_string(),
                abbr: "REDIS".to_string(),
            },
            connection_info: ConnectionInfo {
                client_ip: "10.2.0.1".to_string(),
                client_port: "51000".to_string(),
                server_ip: "10.2.0.7".to_string(),
                server_port: "6379".to_string(),
                is_outgoing: false,
            },
            capture: "af_packet".to_string(),
            timestamp: now.timestamp_millis(),
            pair: RequestResponsePair {
                request: GenericMessage {
                    is_request: true,
                    capture_time: now,
                    capture_size: 40,
                    payload: request,
                },
                response: GenericMessage {
                    is_request: false,
                    capture_time: now,
                    capture_size: 12,
                    payload: response,
                },
            },
        }
    }

    #[test]
    fn test_priorities_and_ports() {
        assert_eq!(GenericCapability::amqp().priority(), 1);
        assert_eq!(GenericCapability::kafka().priority(), 2);
        assert_eq!(GenericCapability::redis().priority(), 3);
        assert_eq!(
            GenericCapability::amqp().protocols()[0].ports,
            vec!["5671", "5672"]
        );
    }

    #[test]
    fn test_claim_port_is_idempotent() {
        let mut redis = GenericCapability::redis();
        redis.claim_port("7000");
        redis.claim_port("7000");
        assert_eq!(redis.protocols()[0].ports, vec!["6379", "7000"]);
    }

    #[test]
    fn test_analyze_and_summarize_redis() {
        let redis = GenericCapability::redis();
        let item = redis_item(
            json!({"command": "GET", "key": "session:42"}),
            json!({"value": "abc"}),
        );
        let entry = redis.analyze(&item).unwrap();
        assert_eq!(entry.protocol.key(), "redis/3.x/REDIS");
        assert_eq!(entry.request["key"], "session:42");

        let summary = redis.summarize(&entry).unwrap();
        assert_eq!(summary.method, "GET");
        assert_eq!(summary.summary, "session:42");
        assert_eq!(summary.method_query, "request.command == \"GET\"");
        assert_eq!(summary.summary_query, "request.key == \"session:42\"");
        assert_eq!(summary.status, 0);
    }

    #[test]
    fn test_analyze_allows_missing_response() {
        let redis = GenericCapability::redis();
        let item = redis_item(json!({"command": "PING"}), Value::Null);
        let entry = redis.analyze(&item).unwrap();
        assert!(entry.response.is_empty());
    }

    #[test]
    fn test_analyze_rejects_foreign_protocol() {
        let kafka = GenericCapability::kafka();
        let item = redis_item(json!({"apiKey": "Produce"}), Value::Null);
        assert_eq!(
            kafka.analyze(&item).unwrap_err(),
            ClassifyError::ProtocolNotFound("redis/3.x/REDIS".to_string())
        );
    }

    #[test]
    fn test_analyze_rejects_non_object_request() {
        let kafka = GenericCapability::kafka();
        let mut item = redis_item(json!("PING"), Value::Null);
        item.protocol = kafka.protocols()[0].summary();
        let err = kafka.analyze(&item).unwrap_err();
        assert!(err.to_string().contains("must be an object, got string"));
    }

    #[test]
    fn test_analyze_requires_method_field() {
        let amqp = GenericCapability::amqp();
        let mut item = redis_item(json!({"queue": "orders"}), Value::Null);
        item.protocol = amqp.protocols()[0].summary();
        let err = amqp.analyze(&item).unwrap_err();
        assert!(err.to_string().contains("`method`"));
    }

    #[test]
    fn test_represent_renders_nested_values_as_bodies() {
        let amqp = GenericCapability::amqp();
        let request = json!({
            "method": "basic.publish",
            "queue": "orders",
            "properties": {"deliveryMode": 2},
            "body": "{\"id\":1}"
        });
        let bytes = amqp
            .represent(request.as_object().unwrap(), &Map::new())
            .unwrap();
        let doc: Value = serde_json::from_slice(&bytes).unwrap();

        let titles: Vec<&str> = doc["request"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["Details", "Body", "properties"]);
        assert!(doc["response"].as_array().unwrap().is_empty());
    }
}
