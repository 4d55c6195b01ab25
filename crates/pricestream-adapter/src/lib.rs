/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public pricestream adapter surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod http;
pub mod types;
pub mod ws;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types from auth
pub use auth::{AssertionSigner, Credential, CredentialCell, CredentialProvider, Grant, PasswordPolicy};

// Re-export commonly used types from http
pub use http::{AuthError, AuthResult, ClientConfig, DiscoveryError, EndpointResolver, RequestPolicy};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    ConnectionState, InboundMessage, ItemRequest, LoginIdentity, Session, SessionError, SessionExit,
    SessionFrame, SessionHandle, SessionSettings,
};
