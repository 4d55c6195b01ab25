/*
[INPUT]:  Public API exports for pricestream-consumer crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod coordinator;

// Re-export main types for convenience
pub use config::{AuthMode, ConsumerConfig, LoginClosedPolicy};
pub use coordinator::{Authenticator, Coordinator, CoordinatorError, CoordinatorOptions};
