//! Read model builders.
//!
//! Projections consume published envelopes and build query-optimized rows.
//! They are tenant-isolated, idempotent under redelivery and can always be
//! rebuilt from the event store.

pub mod stock_levels;

pub use stock_levels::{BatchReadModel, ProjectionError, StockProjection, StockReadModel};
