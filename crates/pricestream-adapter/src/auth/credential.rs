/*
[INPUT]:  Token responses from the authentication endpoint
[OUTPUT]: Immutable Credential values, refresh timing, a shared snapshot cell
[POS]:    Auth layer - token lifecycle data
[UPDATE]: When the token response shape or refresh timing changes
*/

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Tokens shorter than this refresh at 95% of their lifetime
const SHORT_TOKEN_SECS: u64 = 600;

/// Longer tokens are refreshed on this fixed interval
const LONG_TOKEN_REFRESH_SECS: u64 = 300;

/// One issued access token. Replaced wholesale, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// Lifetime in seconds; `None` means the token does not expire
    pub expires_in: Option<u64>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            issued_at: Utc::now(),
            expires_in: expires_in.filter(|secs| *secs > 0),
        }
    }

    /// `None` for non-expiring tokens and lifetimes past the calendar range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in?).ok()?;
        self.issued_at.checked_add_signed(TimeDelta::try_seconds(secs)?)
    }

    /// Point in time at which a proactive refresh is due.
    pub fn refresh_due_at(&self) -> Option<DateTime<Utc>> {
        let delay = TimeDelta::from_std(refresh_delay(self.expires_in?)).ok()?;
        self.issued_at.checked_add_signed(delay)
    }

    /// A credential past its refresh point should be renewed before reuse.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.refresh_due_at().is_some_and(|due| now >= due)
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

/// Delay after issuance at which a token of the given lifetime is refreshed.
///
/// Short tokens refresh at 95% of their lifetime; anything from ten minutes
/// up is rechecked every five minutes however long it lives.
pub fn refresh_delay(expires_in: u64) -> Duration {
    if expires_in < SHORT_TOKEN_SECS {
        Duration::from_millis(expires_in * 950)
    } else {
        Duration::from_secs(LONG_TOKEN_REFRESH_SECS)
    }
}

/// JSON body of a successful token response
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<u64>,
}

impl From<TokenResponse> for Credential {
    fn from(response: TokenResponse) -> Self {
        Credential::new(response.access_token, response.refresh_token, response.expires_in)
    }
}

/// `expires_in` arrives as a number or as a numeric string depending on the server.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(u64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(secs)) => Ok(Some(secs)),
        Some(Seconds::Text(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Thread-safe holder of the current credential snapshot
#[derive(Debug, Clone, Default)]
pub struct CredentialCell {
    current: Arc<RwLock<Option<Arc<Credential>>>>,
}

impl CredentialCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new credential; readers see either the old or the new one.
    pub fn replace(&self, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Arc::clone(&credential));
        credential
    }

    pub fn snapshot(&self) -> Option<Arc<Credential>> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    pub fn clear(&self) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }
}
