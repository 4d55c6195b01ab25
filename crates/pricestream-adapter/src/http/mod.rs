/*
[INPUT]:  HTTP client configuration, auth and discovery endpoints
[OUTPUT]: Configured clients, retry policy, typed HTTP errors, endpoint resolution
[POS]:    HTTP layer - REST communication with the auth and discovery services
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod discovery;
pub mod error;
pub mod policy;

pub use client::ClientConfig;
pub use discovery::EndpointResolver;
pub use error::{AuthError, AuthResult, DiscoveryError};
pub use policy::{RequestPolicy, StatusClass};
