/*
[INPUT]:  None (pure data definitions)
[OUTPUT]: Shared data types for endpoints and discovery records
[POS]:    Data model - shared across http and ws layers
[UPDATE]: When the discovery schema changes
*/

pub mod endpoint;

pub use endpoint::{
    DiscoveryResponse, Endpoint, EndpointSet, ServiceRecord, WsScheme, select_endpoints,
};
