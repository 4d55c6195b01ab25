/*
[INPUT]:  Discovery URL, bearer token, region, hot-standby flag, explicit hosts
[OUTPUT]: EndpointSet of one or two gateway endpoints
[POS]:    HTTP layer - service discovery for the streaming gateway
[UPDATE]: When the discovery request or endpoint selection changes
*/

use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use tracing::{debug, info, warn};

use super::client::ClientConfig;
use super::error::DiscoveryError;
use super::policy::{RedirectStep, RequestPolicy, StatusClass};
use crate::types::{DiscoveryResponse, Endpoint, EndpointSet, select_endpoints};

/// Resolves the gateway endpoints a session set connects to
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    http: Client,
    discovery_url: Url,
    policy: RequestPolicy,
}

impl EndpointResolver {
    pub fn new(http: Client, discovery_url: Url, policy: RequestPolicy) -> Self {
        Self {
            http,
            discovery_url,
            policy,
        }
    }

    /// Build a resolver with its own reqwest client.
    pub fn from_config(
        config: &ClientConfig,
        discovery_url: Url,
        policy: RequestPolicy,
    ) -> Result<Self, DiscoveryError> {
        Ok(Self::new(config.build_client()?, discovery_url, policy))
    }

    /// Return the explicit endpoints when given, otherwise query discovery.
    pub async fn resolve(
        &self,
        hot_standby: bool,
        region: &str,
        explicit: &[Endpoint],
        token: Option<&str>,
    ) -> Result<EndpointSet, DiscoveryError> {
        if let Some(set) = EndpointSet::from_vec(explicit.to_vec()) {
            info!(endpoints = set.len(), "using explicit endpoints, discovery skipped");
            return Ok(set);
        }

        let response = self.fetch_services(token).await?;
        let set = select_endpoints(&response.services, hot_standby, region).ok_or_else(|| {
            DiscoveryError::NoEndpointsFound {
                region: region.to_string(),
                hot_standby,
            }
        })?;

        for endpoint in set.iter() {
            info!(
                endpoint = %endpoint,
                locations = ?endpoint.location_tags,
                "discovered gateway endpoint"
            );
        }
        Ok(set)
    }

    async fn fetch_services(&self, token: Option<&str>) -> Result<DiscoveryResponse, DiscoveryError> {
        let mut start = self.discovery_url.clone();
        start
            .query_pairs_mut()
            .append_pair("transport", "websocket");

        let mut url = start.clone();
        let mut hops = 0usize;

        loop {
            let mut request = self.http.get(url.clone()).header(ACCEPT, "application/json");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }

            debug!(url = %url, "sending service discovery request");
            let sent = tokio::select! {
                _ = self.policy.shutdown().cancelled() => return Err(DiscoveryError::Canceled),
                sent = request.send() => sent,
            };

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %url, error = %err, "service discovery request failed, retrying");
                    if !self.policy.backoff().await {
                        return Err(DiscoveryError::Canceled);
                    }
                    url = start.clone();
                    hops = 0;
                    continue;
                }
            };

            let status = response.status();
            match StatusClass::of(status) {
                StatusClass::Success => {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(err) => {
                            warn!(url = %url, error = %err, "reading service discovery response failed, retrying");
                            if !self.policy.backoff().await {
                                return Err(DiscoveryError::Canceled);
                            }
                            url = start.clone();
                            hops = 0;
                            continue;
                        }
                    };
                    debug!(status = status.as_u16(), body = %body, "service discovery response");
                    return serde_json::from_str(&body)
                        .map_err(|err| DiscoveryError::InvalidResponse(err.to_string()));
                }
                StatusClass::Redirect => {
                    match self.policy.follow_redirect(&url, &response, &mut hops) {
                        RedirectStep::Follow(next) => {
                            info!(status = status.as_u16(), location = %next, "service discovery redirected");
                            url = next;
                        }
                        RedirectStep::MissingLocation => return Err(DiscoveryError::http(status)),
                        RedirectStep::LimitReached(limit) => {
                            return Err(DiscoveryError::TooManyRedirects { limit });
                        }
                        RedirectStep::BadLocation(err) => return Err(err.into()),
                    }
                }
                StatusClass::Rejected => return Err(DiscoveryError::http(status)),
                StatusClass::Unrecoverable => return Err(DiscoveryError::unrecoverable(status)),
                StatusClass::Retry => {
                    warn!(
                        status = status.as_u16(),
                        reason = status.canonical_reason().unwrap_or(""),
                        "service discovery failed, retrying"
                    );
                    if !self.policy.backoff().await {
                        return Err(DiscoveryError::Canceled);
                    }
                    url = start.clone();
                    hops = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_explicit_endpoints_skip_discovery() {
        let config = ClientConfig::default();
        // Nothing listens here; an HTTP call would fail the test by retrying forever.
        let url = Url::parse("http://127.0.0.1:1/discovery").unwrap();
        let resolver =
            EndpointResolver::from_config(&config, url, RequestPolicy::new(&config, CancellationToken::new()))
                .unwrap();

        let explicit = vec![
            Endpoint::explicit("primary.example", 443),
            Endpoint::explicit("standby.example", 443),
        ];
        let set = resolver.resolve(false, "us-east-1", &explicit, None).await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.primary().host, "primary.example");
    }
}
