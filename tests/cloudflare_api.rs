//! Cloudflare adapter tests against a mock API server.

mod common;

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::record_data;
use trafegodns::model::RecordType;
use trafegodns::provider::{CloudflareProvider, DnsProvider, ProviderError, TunnelOps};

const ZONE_ID: &str = "023e105f4ecef8ad9ca31a8372d0c353";

async fn mock_zone_lookup(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/zones"))
        .and(query_param("name", "example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [{ "id": ZONE_ID, "name": "example.com" }]
        })))
        .mount(server)
        .await;
}

fn provider(server: &MockServer) -> CloudflareProvider {
    CloudflareProvider::with_base_url("test-token", "example.com", None, &server.uri())
}

#[tokio::test]
async fn test_list_records() {
    let server = MockServer::start().await;
    mock_zone_lookup(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("/zones/{}/dns_records", ZONE_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": [
                {
                    "id": "rec1",
                    "type": "A",
                    "name": "app.example.com",
                    "content": "10.0.0.1",
                    "ttl": 300,
                    "proxied": false
                },
                {
                    "id": "rec2",
                    "type": "CNAME",
                    "name": "www.example.com",
                    "content": "example.com",
                    "ttl": 1,
                    "proxied": true
                }
            ]
        })))
        .mount(&server)
        .await;

    let records = provider(&server).list_records().await.unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].external_id, "rec1");
    assert_eq!(records[0].data.record_type, RecordType::A);
    assert_eq!(records[1].data.proxied, Some(true));
}

#[tokio::test]
async fn test_create_record() {
    let server = MockServer::start().await;
    mock_zone_lookup(&server).await;

    Mock::given(method("POST"))
        .and(path(format!("/zones/{}/dns_records", ZONE_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": {
                "id": "new-record-id",
                "type": "A",
                "name": "app.example.com",
                "content": "10.0.0.1",
                "ttl": 300
            }
        })))
        .mount(&server)
        .await;

    let external_id = provider(&server)
        .create_record(&record_data("app.example.com", RecordType::A, "10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(external_id, "new-record-id");

    // The payload carried the proxied flag for a proxyable type
    let requests = server.received_requests().await.unwrap();
    let create = requests
        .iter()
        .find(|request| request.method == wiremock::http::Method::POST)
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&create.body).unwrap();
    assert_eq!(body["proxied"], false);
    assert_eq!(body["ttl"], 300);
}

#[tokio::test]
async fn test_duplicate_create_maps_to_conflict() {
    let server = MockServer::start().await;
    mock_zone_lookup(&server).await;

    Mock::given(method("POST"))
        .and(path(format!("/zones/{}/dns_records", ZONE_ID)))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "success": false,
            "errors": [{ "code": 81057, "message": "Record already exists." }],
            "result": null
        })))
        .mount(&server)
        .await;

    let error = provider(&server)
        .create_record(&record_data("app.example.com", RecordType::A, "10.0.0.1"))
        .await
        .unwrap_err();

    assert!(matches!(error, ProviderError::Conflict(_)));
}

#[tokio::test]
async fn test_bad_token_maps_to_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/zones"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "success": false,
            "errors": [{ "code": 9103, "message": "Unknown X-Auth-Key or X-Auth-Email" }],
            "result": null
        })))
        .mount(&server)
        .await;

    let error = provider(&server).test_connection().await.unwrap_err();
    assert!(matches!(error, ProviderError::Auth(_)));
}

#[tokio::test]
async fn test_rate_limit_maps_to_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/zones"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let error = provider(&server).list_records().await.unwrap_err();
    assert!(matches!(error, ProviderError::RateLimited { .. }));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_delete_tolerates_not_found() {
    let server = MockServer::start().await;
    mock_zone_lookup(&server).await;

    Mock::given(method("DELETE"))
        .and(path(format!("/zones/{}/dns_records/gone", ZONE_ID)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "success": false,
            "errors": [{ "code": 81044, "message": "Record does not exist." }],
            "result": null
        })))
        .mount(&server)
        .await;

    provider(&server).delete_record("gone").await.unwrap();
}

#[tokio::test]
async fn test_tunnel_upsert_keeps_catch_all_last() {
    let server = MockServer::start().await;
    let provider = CloudflareProvider::with_base_url(
        "test-token",
        "example.com",
        Some("account-1".into()),
        &server.uri(),
    );

    let config_path = "/accounts/account-1/cfd_tunnel/tunnel-1/configurations";

    Mock::given(method("GET"))
        .and(path(config_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": {
                "config": {
                    "ingress": [
                        { "hostname": "existing.example.com", "service": "http://web:80" },
                        { "service": "http_status:404" }
                    ]
                }
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path(config_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": {}
        })))
        .mount(&server)
        .await;

    let ops = provider.tunnel_ops().unwrap();
    ops.upsert_ingress(
        "tunnel-1",
        &trafegodns::provider::IngressRule {
            hostname: Some("new.example.com".into()),
            service: "http://api:8080".into(),
            path: None,
            origin: Default::default(),
        },
    )
    .await
    .unwrap();

    let requests = server.received_requests().await.unwrap();
    let put = requests
        .iter()
        .find(|request| request.method == wiremock::http::Method::PUT)
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&put.body).unwrap();

    let ingress = body["config"]["ingress"].as_array().unwrap();
    assert_eq!(ingress.len(), 3);
    assert_eq!(ingress[0]["hostname"], "existing.example.com");
    assert_eq!(ingress[1]["hostname"], "new.example.com");
    // Catch-all must stay last and have no hostname
    assert!(ingress[2].get("hostname").is_none());
    assert_eq!(ingress[2]["service"], "http_status:404");
}

#[tokio::test]
async fn test_remove_ingress_absent_hostname_is_noop() {
    let server = MockServer::start().await;
    let provider = CloudflareProvider::with_base_url(
        "test-token",
        "example.com",
        Some("account-1".into()),
        &server.uri(),
    );

    Mock::given(method("GET"))
        .and(path("/accounts/account-1/cfd_tunnel/tunnel-1/configurations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "errors": [],
            "result": { "config": { "ingress": [ { "service": "http_status:404" } ] } }
        })))
        .mount(&server)
        .await;

    let ops = provider.tunnel_ops().unwrap();
    ops.remove_ingress("tunnel-1", "missing.example.com")
        .await
        .unwrap();

    // No PUT was issued for a no-op removal
    let requests = server.received_requests().await.unwrap();
    assert!(
        !requests
            .iter()
            .any(|request| request.method == wiremock::http::Method::PUT)
    );
}
