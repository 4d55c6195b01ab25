/*
[INPUT]:  Grant configuration, JWK key material, token endpoint responses
[OUTPUT]: Credentials, refresh timing, signed client assertions
[POS]:    Auth layer - credential provider for the streaming gateway
[UPDATE]: When the auth flow or grant types change
*/

pub mod assertion;
pub mod credential;
pub mod grant;
pub mod password;
pub mod provider;

pub use assertion::{AssertionSigner, Jwk, JwsAlgorithm};
pub use credential::{Credential, CredentialCell, refresh_delay};
pub use grant::{DEFAULT_SCOPE, Grant};
pub use password::PasswordPolicy;
pub use provider::CredentialProvider;
