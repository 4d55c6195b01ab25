/*
[INPUT]:  HTTP configuration (timeouts, redirect bound, retry backoff)
[OUTPUT]: Configured reqwest client that leaves redirects to the caller
[POS]:    HTTP layer - core client construction shared by auth and discovery
[UPDATE]: When adding connection options or changing client behavior
*/

use reqwest::{Client, redirect};
use std::time::Duration;

/// Hop limit for redirect chains on auth and discovery requests
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Fixed delay between retries of a failed auth or discovery request
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub retry_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl ClientConfig {
    /// Build the reqwest client.
    ///
    /// Automatic redirects are disabled: the credential provider and the
    /// endpoint resolver count hops themselves.
    pub fn build_client(&self) -> Result<Client, reqwest::Error> {
        Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .redirect(redirect::Policy::none())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
        assert!(config.build_client().is_ok());
    }
}
