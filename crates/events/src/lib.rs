//! Event envelope, validation, and wire formats for the MNX spine.

pub mod envelope;
pub mod kinds;
pub mod payloads;
pub mod record;

pub use envelope::{By, EventEnvelope, ValidationLimits};
pub use record::{AppendReceipt, Delivery, EventRecord};
