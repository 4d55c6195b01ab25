/*
[INPUT]:  Mock token/discovery servers and mock gateways
[OUTPUT]: Shared fixtures for coordinator integration tests
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for pricestream-consumer tests

use std::time::Duration;

use pricestream_adapter::{
    ClientConfig, CredentialProvider, Endpoint, EndpointResolver, Grant, ItemRequest, RequestPolicy,
    SessionSettings, WsScheme,
};
use pricestream_consumer::{Authenticator, Coordinator, CoordinatorOptions};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN_PATH: &str = "/token";
#[allow(dead_code)]
pub const DISCOVERY_PATH: &str = "/streaming/pricing/v1/";

/// Setup a mock HTTP server for testing
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Client config with a short retry backoff so retry paths finish quickly
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        retry_backoff: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

/// Plain `ws://` sessions with short delays
pub fn session_settings() -> SessionSettings {
    let mut settings = SessionSettings::new("256", ItemRequest::single("/TRI.N"));
    settings.scheme = WsScheme::Ws;
    settings.reconnect_delay = Duration::from_millis(50);
    settings.connect_timeout = Duration::from_secs(2);
    settings
}

pub fn password_provider(server: &MockServer, shutdown: &CancellationToken) -> Authenticator {
    let config = fast_config();
    let url = Url::parse(&format!("{}{TOKEN_PATH}", server.uri())).unwrap();
    let provider = CredentialProvider::from_config(
        &config,
        url,
        Grant::password("user", "secret", "app-key"),
        RequestPolicy::new(&config, shutdown.clone()),
    )
    .unwrap();
    Authenticator::Token(provider)
}

pub fn resolver_for(server: &MockServer, shutdown: &CancellationToken) -> EndpointResolver {
    let config = fast_config();
    let url = Url::parse(&format!("{}{DISCOVERY_PATH}", server.uri())).unwrap();
    EndpointResolver::from_config(&config, url, RequestPolicy::new(&config, shutdown.clone())).unwrap()
}

/// Options pointing straight at `endpoints`
#[allow(dead_code)]
pub fn explicit_options(endpoints: Vec<Endpoint>) -> CoordinatorOptions {
    CoordinatorOptions {
        explicit: endpoints,
        refresh_retry_delay: Duration::from_millis(100),
        ..CoordinatorOptions::default()
    }
}

/// Coordinator with a password grant against `server`
#[allow(dead_code)]
pub fn coordinator(
    server: &MockServer,
    options: CoordinatorOptions,
    shutdown: &CancellationToken,
) -> Coordinator {
    Coordinator::new(
        password_provider(server, shutdown),
        resolver_for(server, shutdown),
        session_settings(),
        options,
        shutdown.clone(),
    )
}

/// Token endpoint response body
#[allow(dead_code)]
pub fn token_body(access: &str, refresh: Option<&str>, expires_in: u64) -> Value {
    let mut body = json!({ "access_token": access, "expires_in": expires_in, "token_type": "Bearer" });
    if let Some(refresh) = refresh {
        body["refresh_token"] = Value::String(refresh.to_string());
    }
    body
}

/// Mount a full password grant answer
#[allow(dead_code)]
pub async fn mount_password_grant(server: &MockServer, body: Value) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Discovery record for a local gateway port
#[allow(dead_code)]
pub fn local_service(port: u16, locations: &[&str]) -> Value {
    json!({
        "port": port,
        "location": locations,
        "transport": "websocket",
        "provider": "aws",
        "endpoint": "127.0.0.1",
        "dataFormat": ["tr_json2"]
    })
}

/// Port nothing listens on
#[allow(dead_code)]
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
