//! Integration tests for the gateway (client-credentials) connection.

use gridlink::{GatewayConnection, JobService, LinkError};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_token_endpoint(server: &MockServer) {
    // base64("key:secret")
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("authorization", "Basic a2V5OnNlY3JldA=="))
        .and(body_string("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gw-token",
            "scope": "default",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn connect_exchanges_consumer_credentials_for_a_token() {
    let server = MockServer::start().await;
    mock_token_endpoint(&server).await;

    let mut conn =
        GatewayConnection::with_url(server.uri()).with_credentials("key", "secret");
    assert!(!conn.is_open());

    conn.connect().await.expect("gateway connect");
    assert!(conn.is_open());
    let token = conn.token().unwrap();
    assert_eq!(token.access_token, "gw-token");
    assert_eq!(token.expires_in, 3600);

    conn.close().await;
    assert!(!conn.is_open());
    assert!(conn.token().is_none());
}

#[tokio::test]
async fn connect_is_a_noop_when_already_open() {
    let server = MockServer::start().await;
    mock_token_endpoint(&server).await;

    let mut conn =
        GatewayConnection::with_url(server.uri()).with_credentials("key", "secret");
    conn.connect().await.unwrap();
    // The token endpoint mock allows exactly one call.
    conn.connect().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn rejected_credentials_are_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut conn =
        GatewayConnection::with_url(server.uri()).with_credentials("key", "wrong");
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Authentication(_)));
    assert!(!conn.is_open());
}

#[tokio::test]
async fn operations_go_through_the_gateway_prefix() {
    let server = MockServer::start().await;
    mock_token_endpoint(&server).await;
    Mock::given(method("GET"))
        .and(path("/gridlink/request/exec-1"))
        .and(header("authorization", "Bearer gw-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "exec-1",
            "status": "DONE"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn =
        GatewayConnection::with_url(server.uri()).with_credentials("key", "secret");
    conn.connect().await.unwrap();

    let info = conn.request_info("exec-1").await.unwrap();
    assert_eq!(info.id, "exec-1");
    conn.close().await;
}

#[tokio::test]
async fn missing_credentials_fail_before_any_network_call() {
    std::env::remove_var("GRIDLINK_CONSUMER_KEY");
    std::env::remove_var("GRIDLINK_CONSUMER_SECRET");

    let server = MockServer::start().await;
    let mut conn = GatewayConnection::with_url(server.uri());
    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, LinkError::Authentication(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
