/*
[INPUT]:  Gateway endpoints, login identities, session settings
[OUTPUT]: Logged-in sessions streaming decoded gateway messages
[POS]:    WebSocket layer - gateway sessions
[UPDATE]: When adding message kinds or changing session lifecycle
*/

pub mod client;
pub mod error;
pub mod message;
pub mod session;

pub use client::{GatewayWebSocket, SUBPROTOCOL};
pub use error::SessionError;
pub use message::{InboundMessage, ItemRequest, LoginIdentity, SessionFrame, StreamState};
pub use session::{
    ConnectionState, PostingSettings, Session, SessionCommand, SessionExit, SessionHandle,
    SessionSettings,
};
