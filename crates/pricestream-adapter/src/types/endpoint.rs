/*
[INPUT]:  Service discovery records or explicitly configured hosts
[OUTPUT]: Endpoint / EndpointSet values and the hot-standby selection policy
[POS]:    Data model - gateway addresses
[UPDATE]: When the discovery schema or endpoint selection rules change
*/

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket scheme used to reach an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsScheme {
    #[default]
    Wss,
    Ws,
}

impl WsScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            WsScheme::Wss => "wss",
            WsScheme::Ws => "ws",
        }
    }
}

/// One gateway address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub location_tags: Vec<String>,
}

impl Endpoint {
    /// Endpoint supplied on the command line or in config (no location tags)
    pub fn explicit(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            location_tags: Vec::new(),
        }
    }

    /// WebSocket URL of the gateway's streaming path
    pub fn websocket_url(&self, scheme: WsScheme) -> String {
        format!("{}://{}:{}/WebSocket", scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered set of one or two endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn single(endpoint: Endpoint) -> Self {
        Self {
            endpoints: vec![endpoint],
        }
    }

    pub fn pair(primary: Endpoint, standby: Endpoint) -> Self {
        Self {
            endpoints: vec![primary, standby],
        }
    }

    /// Build from up to two endpoints; extra entries are ignored.
    pub fn from_vec(mut endpoints: Vec<Endpoint>) -> Option<Self> {
        if endpoints.is_empty() {
            return None;
        }
        endpoints.truncate(2);
        Some(Self { endpoints })
    }

    pub fn primary(&self) -> &Endpoint {
        &self.endpoints[0]
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }
}

impl IntoIterator for EndpointSet {
    type Item = Endpoint;
    type IntoIter = std::vec::IntoIter<Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.into_iter()
    }
}

/// One `services[]` entry of the discovery response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceRecord {
    pub endpoint: String,
    pub port: u16,
    #[serde(default)]
    pub location: Vec<String>,
}

impl ServiceRecord {
    fn matches_region(&self, region: &str) -> bool {
        self.location
            .first()
            .is_some_and(|tag| tag.starts_with(region))
    }

    fn to_endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.endpoint.clone(),
            port: self.port,
            location_tags: self.location.clone(),
        }
    }
}

/// Discovery response body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryResponse {
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

/// Apply the region filter and the hot-standby partition.
///
/// Hot standby wants two independent replicas, i.e. records exposing exactly
/// one location. Otherwise a load-balanced record (two or more locations) is
/// preferred, with any single-location record as fallback.
pub fn select_endpoints(
    records: &[ServiceRecord],
    hot_standby: bool,
    region: &str,
) -> Option<EndpointSet> {
    let in_region: Vec<&ServiceRecord> = records
        .iter()
        .filter(|record| record.matches_region(region))
        .collect();

    let single_location = in_region
        .iter()
        .filter(|record| record.location.len() == 1)
        .map(|record| record.to_endpoint());

    if hot_standby {
        let replicas: Vec<Endpoint> = single_location.take(2).collect();
        if replicas.len() < 2 {
            return None;
        }
        return EndpointSet::from_vec(replicas);
    }

    in_region
        .iter()
        .find(|record| record.location.len() >= 2)
        .map(|record| record.to_endpoint())
        .or_else(|| single_location.into_iter().next())
        .map(EndpointSet::single)
}
