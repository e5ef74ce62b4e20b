//! Infrastructure layer: event store, dispatch, stock ledger, read models,
//! document workflows and background runners.

pub mod alerts;
pub mod command_dispatcher;
pub mod config;
pub mod db;
pub mod event_store;
pub mod ledger;
pub mod projections;
pub mod read_model;
pub mod workers;
pub mod workflows;

#[cfg(test)]
mod integration_tests;
