/*
[INPUT]:  WebSocket transport failures, server stream states, encode failures
[OUTPUT]: Typed SessionError values
[POS]:    Error handling layer - failures of a gateway session
[UPDATE]: When adding session failure modes
*/

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::message::StreamState;

#[derive(Error, Debug)]
pub enum SessionError {
    /// Opening the transport failed or timed out
    #[error("failed to connect to {url}: {reason}")]
    ConnectFailure { url: String, reason: String },

    /// The transport went away after it was open
    #[error("connection dropped: {0}")]
    TransportDropped(String),

    /// The server closed the login stream
    #[error("server closed the login stream (state {state:?})")]
    ServerClosedStream { state: Option<StreamState> },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session canceled")]
    Canceled,
}

impl SessionError {
    pub(crate) fn connect(url: &str, err: impl std::fmt::Display) -> Self {
        SessionError::ConnectFailure {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        SessionError::TransportDropped(err.to_string())
    }
}
