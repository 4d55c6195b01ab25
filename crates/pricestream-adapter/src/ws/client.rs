/*
[INPUT]:  Gateway WebSocket URL and connect timeout
[OUTPUT]: A tr_json2 text transport with inbound and outbound channels
[POS]:    WebSocket layer - raw connection handling under a Session
[UPDATE]: When changing the handshake, framing or IO task behavior
*/

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::{debug, warn};

use super::error::SessionError;

/// WebSocket subprotocol spoken by the gateway
pub const SUBPROTOCOL: &str = "tr_json2";

const CHANNEL_CAPACITY: usize = 100;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
pub(crate) const RAW_LOG_MAX_BYTES: usize = 1024;

/// One open connection to a gateway endpoint
#[derive(Debug)]
pub struct GatewayWebSocket {
    url: String,
    outbound_tx: mpsc::Sender<WsMessage>,
    inbound_rx: mpsc::Receiver<Result<String, SessionError>>,
    io_task: JoinHandle<()>,
}

impl GatewayWebSocket {
    /// Open the connection, negotiating the `tr_json2` subprotocol.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, SessionError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| SessionError::connect(url, err))?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _response) = match tokio::time::timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(err)) => return Err(SessionError::connect(url, err)),
            Err(_) => {
                return Err(SessionError::connect(
                    url,
                    format!("timed out after {}s", connect_timeout.as_secs()),
                ));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task_url = url.to_string();

        let io_task = tokio::spawn(async move {
            let exit: Result<(), SessionError> = loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if let Err(err) = write.send(message).await {
                                    break Err(err.into());
                                }
                            }
                            None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break Ok(());
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                if inbound_tx.send(Ok(text.to_string())).await.is_err() {
                                    break Ok(());
                                }
                            }
                            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => {
                                    if inbound_tx.send(Ok(text)).await.is_err() {
                                        break Ok(());
                                    }
                                }
                                Err(_) => debug!(url = %task_url, bytes = bytes.len(), "non-utf8 binary frame ignored"),
                            },
                            Some(Ok(WsMessage::Close(frame))) => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                let reason = frame
                                    .map(|f| format!("server closed connection ({} {})", f.code, f.reason))
                                    .unwrap_or_else(|| "server closed connection".to_string());
                                break Err(SessionError::TransportDropped(reason));
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => break Err(err.into()),
                            None => break Err(SessionError::TransportDropped("connection closed".to_string())),
                        }
                    }
                }
            };

            if let Err(err) = exit {
                debug!(url = %task_url, error = %err, "ws io task ended");
                let _ = inbound_tx.send(Err(err)).await;
            }
        });

        Ok(Self {
            url: url.to_string(),
            outbound_tx,
            inbound_rx,
            io_task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.outbound_tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| SessionError::TransportDropped("send channel closed".to_string()))
    }

    /// Next text frame. An error means the connection is gone.
    pub async fn recv(&mut self) -> Result<String, SessionError> {
        self.inbound_rx
            .recv()
            .await
            .unwrap_or_else(|| Err(SessionError::TransportDropped("connection closed".to_string())))
    }

    /// Send a close frame and wait briefly for the IO task to finish.
    pub async fn close(self) {
        let Self {
            url,
            outbound_tx,
            inbound_rx,
            mut io_task,
        } = self;
        drop(outbound_tx);
        drop(inbound_rx);
        if tokio::time::timeout(CLOSE_GRACE, &mut io_task).await.is_err() {
            warn!(url = %url, "ws io task did not stop in time, aborting");
            io_task.abort();
        }
    }
}

pub(crate) fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
