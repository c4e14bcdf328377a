//! Append-only event log with transactional outbox and dead-letter queue.

mod in_memory;
mod postgres;
#[allow(clippy::module_inception)]
mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, run_migrations};
pub use r#trait::{
    DlqEntry, EventStore, EventStoreError, OutboxClaim, OutboxEntry, RetryDisposition, ScopeLag,
};
