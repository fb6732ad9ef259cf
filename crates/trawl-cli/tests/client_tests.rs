//! Integration tests for the gateway client against a wiremock gateway

use std::time::Duration;

use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

use trawl::classify::CapabilityRegistry;
use trawl::entries::EntriesRequest;
use trawl::replay::ReplayRequest;
use trawl::testing::{metadata, sample_entry};
use trawl_cli::client::GatewayClient;

fn client(server: &MockServer) -> GatewayClient {
    GatewayClient::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_entries_sends_query_parameters() {
    let mock_server = MockServer::start().await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/entries"))
        .and(matchers::query_param("query", "http"))
        .and(matchers::query_param("limit", "5"))
        .and(matchers::query_param("leftOff", "c9"))
        .and(matchers::query_param("direction", "-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [],
            "meta": metadata("c4"),
        })))
        .mount(&mock_server)
        .await;

    let page = client(&mock_server)
        .entries(&EntriesRequest {
            query: "http".to_string(),
            limit: 5,
            left_off: "c9".to_string(),
            ..EntriesRequest::default()
        })
        .await
        .unwrap();

    assert!(page.data.is_empty());
    assert_eq!(page.meta.unwrap().left_off, "c4");
}

#[tokio::test]
async fn test_gateway_error_body_becomes_message() {
    let mock_server = MockServer::start().await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/entries"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": true,
            "type": "error",
            "autoClose": "5000",
            "msg": "missing operand",
        })))
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .entries(&EntriesRequest::default())
        .await
        .unwrap_err();
    assert!(err.to_string().ends_with("missing operand"));
}

#[tokio::test]
async fn test_validate_and_entry_paths() {
    let mock_server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/query/validate"))
        .and(matchers::body_json(serde_json::json!({"query": "bad"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "valid": false,
            "message": "unexpected token",
        })))
        .mount(&mock_server)
        .await;
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/entries/a%2Fb"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let verdict = client.validate("bad").await.unwrap();
    assert!(!verdict.valid);
    assert_eq!(verdict.message, "unexpected token");

    let err = client.entry("a/b", "").await.unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_replay_round_trip() {
    let mock_server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/replay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": false,
            "data": null,
            "errorMessage": "reached threshold of 5 requests",
        })))
        .mount(&mock_server)
        .await;

    let response = client(&mock_server)
        .replay(&ReplayRequest {
            method: "GET".to_string(),
            url: "http://example.test/".to_string(),
            body: String::new(),
            headers: Default::default(),
        })
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error_message, "reached threshold of 5 requests");
}

#[tokio::test]
async fn test_entry_decodes_wrapper() {
    let mock_server = MockServer::start().await;
    let entry = sample_entry("7");
    Mock::given(matchers::method("GET"))
        .and(matchers::path("/entries/7"))
        .and(matchers::query_param("query", "http"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            CapabilityRegistry::with_defaults().wrap(entry).unwrap(),
        ))
        .mount(&mock_server)
        .await;

    let wrapper = client(&mock_server).entry("7", "http").await.unwrap();
    assert_eq!(wrapper.data.id, "7");
    assert_eq!(wrapper.base.status, 200);
}
