//! Append-only event store boundary.
//!
//! Tenant-scoped event streams with optimistic concurrency and atomic
//! multi-stream appends. Backends: in-memory (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
