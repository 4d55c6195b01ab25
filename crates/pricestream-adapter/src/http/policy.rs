/*
[INPUT]:  HTTP status codes, Location headers, shutdown token
[OUTPUT]: Status classification, bounded redirect resolution, cancellable backoff
[POS]:    HTTP layer - retry policy shared by the credential provider and discovery
[UPDATE]: When the status handling table or backoff semantics change
*/

use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode, Url};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::client::ClientConfig;

/// How a response status is handled by the request loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// 301/302/303/307/308
    Redirect,
    /// 400/401: the caller decides whether a downgrade is possible
    Rejected,
    /// 403/404/410/451
    Unrecoverable,
    /// Anything else, retried after the backoff
    Retry,
}

impl StatusClass {
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            200..=299 => StatusClass::Success,
            301 | 302 | 303 | 307 | 308 => StatusClass::Redirect,
            400 | 401 => StatusClass::Rejected,
            403 | 404 | 410 | 451 => StatusClass::Unrecoverable,
            _ => StatusClass::Retry,
        }
    }
}

/// Outcome of following one redirect hop.
#[derive(Debug)]
pub enum RedirectStep {
    Follow(Url),
    MissingLocation,
    LimitReached(usize),
    BadLocation(url::ParseError),
}

/// Redirect bound and retry backoff for one request loop.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    max_redirects: usize,
    retry_backoff: Duration,
    shutdown: CancellationToken,
}

impl RequestPolicy {
    pub fn new(config: &ClientConfig, shutdown: CancellationToken) -> Self {
        Self {
            max_redirects: config.max_redirects,
            retry_backoff: config.retry_backoff,
            shutdown,
        }
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Resolve the next hop of a redirect chain, counting it against the limit.
    pub fn follow_redirect(&self, current: &Url, response: &Response, hops: &mut usize) -> RedirectStep {
        *hops += 1;
        if *hops > self.max_redirects {
            return RedirectStep::LimitReached(self.max_redirects);
        }

        let Some(location) = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        else {
            return RedirectStep::MissingLocation;
        };

        match current.join(location) {
            Ok(next) => RedirectStep::Follow(next),
            Err(err) => RedirectStep::BadLocation(err),
        }
    }

    /// Sleep for the retry backoff. Returns `false` when shutdown interrupted the wait.
    pub async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.retry_backoff) => true,
        }
    }
}
