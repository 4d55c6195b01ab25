/*
[INPUT]:  Error sources (HTTP transport, status codes, JSON bodies, JWK files)
[OUTPUT]: Typed auth and discovery errors with status context and retry hints
[POS]:    Error handling layer - failures of the HTTP-backed components
[UPDATE]: When adding new error sources or changing the retry classification
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Failure obtaining a credential from the authentication endpoint.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The request never produced an HTTP response
    #[error("authentication transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// Rejected with a status that is not retried (400/401 outside the refresh fallback)
    #[error("authentication failed with HTTP {status} {reason}")]
    HttpError { status: u16, reason: String },

    /// Redirect chain exceeded the hop limit
    #[error("authentication redirected more than {limit} times")]
    TooManyRedirects { limit: usize },

    /// 403/404/410/451: the request must not be retried
    #[error("unrecoverable authentication response HTTP {status} {reason}")]
    Unrecoverable { status: u16, reason: String },

    /// 2xx body that is not a token response
    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    /// Building or signing the JWT client assertion failed
    #[error("client assertion error: {0}")]
    Jwt(String),

    /// Proposed new password violates the password policy
    #[error("new password rejected by policy: {0}")]
    PasswordPolicy(String),

    /// Redirect target could not be parsed
    #[error("invalid redirect location: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The retry loop was interrupted by shutdown
    #[error("authentication canceled")]
    Canceled,
}

impl AuthError {
    /// Build an `HttpError` from a response status
    pub fn http(status: StatusCode) -> Self {
        AuthError::HttpError {
            status: status.as_u16(),
            reason: reason_phrase(status),
        }
    }

    /// Build an `Unrecoverable` error from a response status
    pub fn unrecoverable(status: StatusCode) -> Self {
        AuthError::Unrecoverable {
            status: status.as_u16(),
            reason: reason_phrase(status),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::HttpError { status, .. } | AuthError::Unrecoverable { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Check if the error came from the shutdown signal
    pub fn is_canceled(&self) -> bool {
        matches!(self, AuthError::Canceled)
    }
}

/// Failure locating gateway endpoints through service discovery.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("service discovery transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service discovery failed with HTTP {status} {reason}")]
    HttpError { status: u16, reason: String },

    #[error("service discovery redirected more than {limit} times")]
    TooManyRedirects { limit: usize },

    #[error("unrecoverable service discovery response HTTP {status} {reason}")]
    Unrecoverable { status: u16, reason: String },

    #[error("invalid service discovery response: {0}")]
    InvalidResponse(String),

    #[error("invalid redirect location: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Filtering left nothing to connect to
    #[error("no usable endpoints found (region {region:?}, hot standby {hot_standby})")]
    NoEndpointsFound { region: String, hot_standby: bool },

    #[error("service discovery canceled")]
    Canceled,
}

impl DiscoveryError {
    pub fn http(status: StatusCode) -> Self {
        DiscoveryError::HttpError {
            status: status.as_u16(),
            reason: reason_phrase(status),
        }
    }

    pub fn unrecoverable(status: StatusCode) -> Self {
        DiscoveryError::Unrecoverable {
            status: status.as_u16(),
            reason: reason_phrase(status),
        }
    }
}

fn reason_phrase(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("Unknown").to_string()
}

/// Result type alias for credential operations
pub type AuthResult<T> = std::result::Result<T, AuthError>;
