/*
[INPUT]:  Endpoint, session settings, login identity, cancellation token
[OUTPUT]: A logged-in gateway session; decoded frames to an observer; exit reasons
[POS]:    WebSocket layer - lifecycle of one gateway connection
[UPDATE]: When login, dispatch, posting or reconnect behavior changes
*/

use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{GatewayWebSocket, RAW_LOG_MAX_BYTES, truncate_for_log};
use super::error::SessionError;
use super::message::{
    ITEM_STREAM_ID, InboundMessage, ItemRequest, LoginIdentity, SessionFrame, StreamState,
    login_request, parse_frame, pong, post_message,
};
use crate::types::{Endpoint, WsScheme};

/// Fixed delay before a dropped session reconnects
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Bound on the WebSocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default login position when none is configured
pub const DEFAULT_POSITION: &str = "127.0.0.1/net";

const COMMAND_CAPACITY: usize = 8;

/// Connection state published by each session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Canceled,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

/// Interval posting on the item stream
#[derive(Debug, Clone)]
pub struct PostingSettings {
    pub interval: Duration,
    pub user_id: u32,
    pub fields: Value,
}

impl Default for PostingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            user_id: std::process::id(),
            fields: json!({ "BID": 45.55, "BIDSIZE": 18, "ASK": 45.57, "ASKSIZE": 19 }),
        }
    }
}

/// Settings shared by every session of a set
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub app_id: String,
    pub position: String,
    pub item: ItemRequest,
    pub posting: Option<PostingSettings>,
    pub scheme: WsScheme,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl SessionSettings {
    pub fn new(app_id: impl Into<String>, item: ItemRequest) -> Self {
        Self {
            app_id: app_id.into(),
            position: DEFAULT_POSITION.to_string(),
            item,
            posting: None,
            scheme: WsScheme::Wss,
            connect_timeout: CONNECT_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Instructions delivered to a running session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Relogin(LoginIdentity),
}

/// Why `Session::run` returned
#[derive(Debug)]
pub enum SessionExit {
    /// Transport fault; the session is Reconnecting
    Dropped(SessionError),
    /// The server closed the login stream
    LoginClosed(Option<StreamState>),
    Canceled,
}

/// Cloneable handle used to reach a session running on its own task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Queue a re-login. Returns `false` when the session is gone.
    pub async fn relogin(&self, identity: LoginIdentity) -> bool {
        self.cmd_tx.send(SessionCommand::Relogin(identity)).await.is_ok()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// One WebSocket session to one gateway endpoint
pub struct Session {
    id: Arc<str>,
    endpoint: Endpoint,
    settings: Arc<SessionSettings>,
    transport: Option<GatewayWebSocket>,
    state_tx: watch::Sender<ConnectionState>,
    logged_in: bool,
    item_open: bool,
    next_post_id: u64,
    post_timer: Option<Interval>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    token: CancellationToken,
    observer: Option<mpsc::Sender<SessionFrame>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("logged_in", &self.logged_in)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: impl Into<Arc<str>>,
        endpoint: Endpoint,
        settings: Arc<SessionSettings>,
        token: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        Self {
            id: id.into(),
            endpoint,
            settings,
            transport: None,
            state_tx,
            logged_in: false,
            item_open: false,
            next_post_id: 1,
            post_timer: None,
            cmd_tx,
            cmd_rx,
            token,
            observer: None,
        }
    }

    /// Forward decoded frames (everything except pings) to `observer`.
    pub fn with_observer(mut self, observer: mpsc::Sender<SessionFrame>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: Arc::clone(&self.id),
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_tx.subscribe(),
            token: self.token.clone(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(session = %self.id, from = %previous, to = %state, "session state changed");
        }
    }

    /// Open the transport and send the login request.
    pub async fn connect(&mut self, identity: &LoginIdentity) -> Result<(), SessionError> {
        if self.token.is_cancelled() {
            self.set_state(ConnectionState::Canceled);
            return Err(SessionError::Canceled);
        }

        let url = self.endpoint.websocket_url(self.settings.scheme);
        self.set_state(ConnectionState::Connecting);
        info!(session = %self.id, url = %url, "connecting");

        let connected = tokio::select! {
            _ = self.token.cancelled() => {
                self.set_state(ConnectionState::Canceled);
                return Err(SessionError::Canceled);
            }
            connected = GatewayWebSocket::connect(&url, self.settings.connect_timeout) => connected,
        };

        match connected {
            Ok(transport) => {
                self.transport = Some(transport);
                self.logged_in = false;
                self.item_open = false;
                self.post_timer = None;
                self.set_state(ConnectionState::Open);
                self.send_login(identity).await
            }
            Err(err) => {
                warn!(session = %self.id, url = %url, error = %err, "connect failed");
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Send the login request. Once logged in, the request goes out as a
    /// re-login and the item request is not repeated.
    pub async fn send_login(&mut self, identity: &LoginIdentity) -> Result<(), SessionError> {
        let relogin = self.logged_in;
        let login = login_request(identity, &self.settings.app_id, &self.settings.position, relogin);
        self.send_json(&login).await?;
        info!(session = %self.id, relogin, "login request sent");
        Ok(())
    }

    /// Receive loop. Returns when the connection drops, the login stream
    /// closes or the session is canceled.
    pub async fn run(&mut self) -> SessionExit {
        if self.transport.is_none() {
            return self.dropped(SessionError::TransportDropped("not connected".to_string()));
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.cancel().await;
                    return SessionExit::Canceled;
                }
                Some(command) = self.cmd_rx.recv() => {
                    let SessionCommand::Relogin(identity) = command;
                    if let Err(err) = self.send_login(&identity).await {
                        return self.dropped(err);
                    }
                }
                _ = next_tick(&mut self.post_timer) => {
                    if let Err(err) = self.send_post().await {
                        return self.dropped(err);
                    }
                }
                frame = next_text(&mut self.transport) => {
                    let outcome = match frame {
                        Ok(text) => self.handle_frame(&text).await,
                        Err(err) => Err(err),
                    };
                    match outcome {
                        Ok(None) => {}
                        Ok(Some(exit)) => return exit,
                        Err(err) => return self.dropped(err),
                    }
                }
            }
        }
    }

    /// Wait the reconnect delay, drop the old transport and connect again.
    pub async fn reconnect(&mut self, identity: &LoginIdentity) -> Result<(), SessionError> {
        if self.token.is_cancelled() || self.state() == ConnectionState::Canceled {
            self.set_state(ConnectionState::Canceled);
            return Err(SessionError::Canceled);
        }

        self.set_state(ConnectionState::Reconnecting);
        info!(
            session = %self.id,
            delay_secs = self.settings.reconnect_delay.as_secs(),
            "reconnecting after delay"
        );
        tokio::select! {
            _ = self.token.cancelled() => {
                self.cancel().await;
                return Err(SessionError::Canceled);
            }
            _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
        }

        if let Some(old) = self.transport.take() {
            old.close().await;
        }
        self.connect(identity).await
    }

    /// Cancel the session and close its transport.
    pub async fn cancel(&mut self) {
        self.token.cancel();
        self.post_timer = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.set_state(ConnectionState::Canceled);
    }

    fn dropped(&mut self, err: SessionError) -> SessionExit {
        warn!(session = %self.id, error = %err, "session dropped");
        self.logged_in = false;
        self.item_open = false;
        self.post_timer = None;
        self.set_state(ConnectionState::Reconnecting);
        SessionExit::Dropped(err)
    }

    async fn login_closed(&mut self, state: Option<StreamState>) -> SessionExit {
        warn!(session = %self.id, state = ?state, "login stream closed by server");
        self.logged_in = false;
        self.post_timer = None;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.set_state(ConnectionState::Disconnected);
        SessionExit::LoginClosed(state)
    }

    async fn handle_frame(&mut self, text: &str) -> Result<Option<SessionExit>, SessionError> {
        debug!(
            session = %self.id,
            bytes = text.len(),
            frame = %truncate_for_log(text, RAW_LOG_MAX_BYTES),
            "received frame"
        );

        let messages = match parse_frame(text) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(session = %self.id, error = %err, "unparseable frame ignored");
                return Ok(None);
            }
        };

        for message in messages {
            match &message {
                InboundMessage::Ping => {
                    self.send_json(&pong()).await?;
                    continue;
                }
                InboundMessage::LoginRefresh { state } => {
                    if state.as_ref().is_some_and(|s| !s.is_stream_open()) {
                        return Ok(Some(self.login_closed(state.clone()).await));
                    }
                    if !self.logged_in && state.as_ref().is_none_or(StreamState::is_data_ok) {
                        self.logged_in = true;
                        info!(session = %self.id, "logged in");
                        let request = self.settings.item.to_json();
                        self.send_json(&request).await?;
                        info!(session = %self.id, items = ?self.settings.item.names, "item request sent");
                    }
                }
                InboundMessage::LoginStatus { state } => {
                    if state.as_ref().is_some_and(|s| !s.is_stream_open()) {
                        return Ok(Some(self.login_closed(state.clone()).await));
                    }
                }
                InboundMessage::ItemRefresh { id, state, .. } if *id == ITEM_STREAM_ID => {
                    if state.as_ref().is_some_and(StreamState::is_open_ok) {
                        self.item_open = true;
                        self.start_posting();
                    }
                }
                InboundMessage::Status { id, state, .. } if *id == ITEM_STREAM_ID => {
                    if state.as_ref().is_some_and(|s| !s.is_open_ok()) {
                        self.item_open = false;
                        self.post_timer = None;
                    }
                }
                InboundMessage::Ack {
                    ack_id, nak_code, ..
                } => match nak_code {
                    Some(code) => warn!(session = %self.id, ack_id = ?ack_id, nak_code = %code, "post rejected"),
                    None => info!(session = %self.id, ack_id = ?ack_id, "post acknowledged"),
                },
                _ => {}
            }
            self.observe(message).await;
        }
        Ok(None)
    }

    fn start_posting(&mut self) {
        let Some(posting) = &self.settings.posting else {
            return;
        };
        if self.post_timer.is_some() {
            return;
        }
        let start = tokio::time::Instant::now() + posting.interval;
        let mut timer = tokio::time::interval_at(start, posting.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.post_timer = Some(timer);
        info!(session = %self.id, interval_secs = posting.interval.as_secs(), "posting started");
    }

    async fn send_post(&mut self) -> Result<(), SessionError> {
        let Some(posting) = &self.settings.posting else {
            return Ok(());
        };
        if !self.item_open {
            return Ok(());
        }
        let post = post_message(
            self.next_post_id,
            &self.settings.position,
            posting.user_id,
            &posting.fields,
        );
        self.send_json(&post).await?;
        self.next_post_id += 1;
        Ok(())
    }

    async fn observe(&self, message: InboundMessage) {
        if let Some(observer) = &self.observer {
            let frame = SessionFrame {
                session_id: Arc::clone(&self.id),
                message,
            };
            if observer.send(frame).await.is_err() {
                debug!(session = %self.id, "observer gone, frame discarded");
            }
        }
    }

    async fn send_json(&self, message: &Value) -> Result<(), SessionError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| SessionError::TransportDropped("not connected".to_string()))?;
        let text = serde_json::to_string(message)?;
        debug!(
            session = %self.id,
            frame = %truncate_for_log(&text, RAW_LOG_MAX_BYTES),
            "sending frame"
        );
        transport.send_text(text).await
    }
}

async fn next_text(transport: &mut Option<GatewayWebSocket>) -> Result<String, SessionError> {
    match transport {
        Some(transport) => transport.recv().await,
        None => Err(SessionError::TransportDropped("not connected".to_string())),
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
