//! Tracing and logging setup shared by binaries.

pub mod tracing;

pub use tracing::{LogFormat, init};
