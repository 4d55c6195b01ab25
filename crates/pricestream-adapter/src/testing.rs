/*
[INPUT]:  Test code driving sessions against a local gateway
[OUTPUT]: In-process tr_json2 WebSocket server recording every frame
[POS]:    Test support - mock streaming gateway (cfg test / feature test-util)
[UPDATE]: When sessions rely on new server behavior
*/

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_util::sync::CancellationToken;

use crate::types::Endpoint;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_STEP: Duration = Duration::from_millis(10);

/// How the mock answers login requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginBehavior {
    /// Login refresh with Open/Ok, item refresh with Open/Ok
    Accept,
    /// Login refresh with a Closed stream state
    Reject,
    /// No automatic answers
    Silent,
}

enum GatewayCommand {
    Send(String),
    Drop,
}

#[derive(Default)]
struct Recorded {
    raw: Vec<String>,
    messages: Vec<Value>,
}

struct Shared {
    behavior: LoginBehavior,
    recorded: Mutex<Recorded>,
    connections: AtomicUsize,
    peers: Mutex<Vec<mpsc::UnboundedSender<GatewayCommand>>>,
}

/// Local gateway on `127.0.0.1:<ephemeral>` speaking `tr_json2`
pub struct MockGateway {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl MockGateway {
    pub async fn start() -> Self {
        Self::start_with(LoginBehavior::Accept).await
    }

    pub async fn start_with(behavior: LoginBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("mock gateway address");
        let shared = Arc::new(Shared {
            behavior,
            recorded: Mutex::new(Recorded::default()),
            connections: AtomicUsize::new(0),
            peers: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();

        let accept_shared = Arc::clone(&shared);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let shared = Arc::clone(&accept_shared);
                        let shutdown = accept_shutdown.clone();
                        tokio::spawn(serve_connection(stream, shared, shutdown));
                    }
                }
            }
        });

        Self {
            addr,
            shared,
            shutdown,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::explicit("127.0.0.1", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every message received, in arrival order
    pub fn messages(&self) -> Vec<Value> {
        self.lock_recorded().messages.clone()
    }

    /// Raw text frames containing `needle`
    pub fn raw_frames_matching(&self, needle: &str) -> Vec<String> {
        self.lock_recorded()
            .raw
            .iter()
            .filter(|raw| raw.contains(needle))
            .cloned()
            .collect()
    }

    pub fn login_requests(&self) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["Domain"] == "Login")
            .collect()
    }

    pub fn item_requests(&self) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["ID"] == 2 && m.get("Type").is_none())
            .collect()
    }

    pub fn posts(&self) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["Type"] == "Post")
            .collect()
    }

    /// Send a raw frame on every open connection.
    pub fn push(&self, frame: &str) {
        for peer in self.lock_peers().iter() {
            let _ = peer.send(GatewayCommand::Send(frame.to_string()));
        }
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        for peer in self.lock_peers().drain(..) {
            let _ = peer.send(GatewayCommand::Drop);
        }
    }

    /// Poll `condition` until it holds or five seconds pass.
    pub async fn wait_for(&self, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    fn lock_recorded(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.shared
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<GatewayCommand>>> {
        self.shared.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(stream: TcpStream, shared: Arc<Shared>, shutdown: CancellationToken) {
    let echo_subprotocol = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        Ok(response)
    };
    let Ok(ws) = accept_hdr_async(stream, echo_subprotocol).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    shared
        .peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(commands_tx);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands_rx.recv() => match command {
                Some(GatewayCommand::Send(frame)) => {
                    if write.send(WsMessage::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(GatewayCommand::Drop) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let text = text.to_string();
                    for reply in record_and_answer(&shared, &text) {
                        if write.send(WsMessage::Text(reply.into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn record_and_answer(shared: &Shared, text: &str) -> Vec<String> {
    let messages: Vec<Value> = match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items,
        Ok(other) => vec![other],
        Err(_) => Vec::new(),
    };

    {
        let mut recorded = shared.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.raw.push(text.to_string());
        recorded.messages.extend(messages.iter().cloned());
    }

    let mut replies = Vec::new();
    for message in &messages {
        let is_login = message["Domain"] == "Login";
        let is_relogin = message.get("Refresh") == Some(&Value::Bool(false));
        match shared.behavior {
            LoginBehavior::Accept if is_login && !is_relogin => {
                replies.push(
                    json!([{
                        "ID": 1,
                        "Type": "Refresh",
                        "Domain": "Login",
                        "Key": { "Name": "user" },
                        "State": { "Stream": "Open", "Data": "Ok", "Text": "Login accepted" },
                        "Elements": { "PingTimeout": 30 }
                    }])
                    .to_string(),
                );
            }
            LoginBehavior::Accept if message["ID"] == 2 && message.get("Type").is_none() => {
                replies.push(
                    json!([{
                        "ID": 2,
                        "Type": "Refresh",
                        "Domain": "MarketPrice",
                        "Key": message["Key"].clone(),
                        "State": { "Stream": "Open", "Data": "Ok", "Text": "All is well" },
                        "Fields": { "BID": 45.5, "ASK": 45.6 }
                    }])
                    .to_string(),
                );
            }
            LoginBehavior::Reject if is_login => {
                replies.push(
                    json!([{
                        "ID": 1,
                        "Type": "Refresh",
                        "Domain": "Login",
                        "State": { "Stream": "Closed", "Data": "Suspect", "Text": "Login rejected" }
                    }])
                    .to_string(),
                );
            }
            _ => {}
        }
    }
    replies
}
