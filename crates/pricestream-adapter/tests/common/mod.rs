/*
[INPUT]:  Test configuration and mock server requirements
[OUTPUT]: Shared test utilities, fixtures, and mock helpers
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for pricestream-adapter tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pricestream_adapter::{ClientConfig, CredentialProvider, EndpointResolver, Grant, RequestPolicy};
use reqwest::Url;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

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

#[allow(dead_code)]
pub fn provider_for(server: &MockServer, grant: Grant) -> CredentialProvider {
    let config = fast_config();
    let url = Url::parse(&format!("{}/token", server.uri())).unwrap();
    CredentialProvider::from_config(
        &config,
        url,
        grant,
        RequestPolicy::new(&config, CancellationToken::new()),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn provider_at(url: &str, grant: Grant) -> CredentialProvider {
    let config = fast_config();
    CredentialProvider::from_config(
        &config,
        Url::parse(url).unwrap(),
        grant,
        RequestPolicy::new(&config, CancellationToken::new()),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn resolver_for(server: &MockServer) -> EndpointResolver {
    resolver_at(&format!("{}/streaming/pricing/v1/", server.uri()))
}

#[allow(dead_code)]
pub fn resolver_at(url: &str) -> EndpointResolver {
    let config = fast_config();
    EndpointResolver::from_config(
        &config,
        Url::parse(url).unwrap(),
        RequestPolicy::new(&config, CancellationToken::new()),
    )
    .unwrap()
}

#[allow(dead_code)]
pub fn password_grant() -> Grant {
    Grant::password("user", "secret", "app-key")
}

/// Token endpoint response body
#[allow(dead_code)]
pub fn token_body(access: &str, refresh: Option<&str>, expires_in: Value) -> Value {
    let mut body = json!({ "access_token": access, "expires_in": expires_in, "token_type": "Bearer" });
    if let Some(refresh) = refresh {
        body["refresh_token"] = Value::String(refresh.to_string());
    }
    body
}

/// One discovery record
#[allow(dead_code)]
pub fn service(endpoint: &str, locations: &[&str]) -> Value {
    json!({
        "port": 443,
        "location": locations,
        "transport": "websocket",
        "provider": "aws",
        "endpoint": endpoint,
        "dataFormat": ["tr_json2"]
    })
}

/// HTTP server whose first response is cut off mid-body. Later responses
/// carry `body` in full. Returns the base URL and the number of requests served.
#[allow(dead_code)]
pub async fn truncating_server(body: String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();
            tokio::spawn(async move {
                read_request(&mut stream).await;
                let (declared, sent) = if attempt == 0 {
                    (body.len() + 64, &body[..body.len() / 2])
                } else {
                    (body.len(), body.as_str())
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {declared}\r\nconnection: close\r\n\r\n{sent}"
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), served)
}

/// Read one request, headers and body.
#[allow(dead_code)]
async fn read_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if buf.len() >= end + 4 + length {
            return;
        }
    }
}
