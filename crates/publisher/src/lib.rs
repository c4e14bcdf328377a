//! CDC publisher: crash-safe, at-least-once fan-out from the outbox to the
//! registered projector endpoints.

pub mod config;
pub mod delivery;
pub mod publisher;

pub use config::{PublisherConfig, SubscriberEndpoint};
pub use delivery::{DeliveryFailure, SubscriberClient};
pub use publisher::{Publisher, PublisherError};
