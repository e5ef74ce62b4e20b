//! Scheduled stock alerting.
//!
//! Alerts are notices for people, not domain events: they are derived from
//! the read model and the consistency checker and handed to a sink.

pub mod runner;
pub mod source;

pub use runner::{StockAlertRunner, StockAlertRunnerHandle};
pub use source::LedgerAlertSource;

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use shopfloor_core::{Quantity, TenantId};
use shopfloor_inventory::InventoryItemId;

use crate::event_store::EventStoreError;
use crate::ledger::{ConsistencyError, Discrepancy};
use crate::projections::ProjectionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum StockAlert {
    /// Available stock (raw + finished) at or below the reorder level.
    LowStock {
        item_id: InventoryItemId,
        code: String,
        available: Quantity,
        minimum: Quantity,
    },
    Discrepancy(Discrepancy),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("alert source failed: {0}")]
    Source(String),
}

/// Where alerts come from on each run.
#[async_trait]
pub trait AlertSource: Send + Sync + 'static {
    async fn collect(&self) -> Result<Vec<(TenantId, StockAlert)>, AlertError>;
}

pub trait AlertSink: Send + Sync + 'static {
    fn emit(&self, tenant_id: TenantId, alert: StockAlert);
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    inner: Mutex<Vec<(TenantId, StockAlert)>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(TenantId, StockAlert)> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn emit(&self, tenant_id: TenantId, alert: StockAlert) {
        if let Ok(mut v) = self.inner.lock() {
            v.push((tenant_id, alert));
        }
    }
}

/// Writes every alert to the log at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, tenant_id: TenantId, alert: StockAlert) {
        match &alert {
            StockAlert::LowStock {
                item_id,
                code,
                available,
                minimum,
            } => warn!(
                tenant = %tenant_id,
                item_id = %item_id,
                code = %code,
                available = %available,
                minimum = %minimum,
                "low stock"
            ),
            StockAlert::Discrepancy(d) => warn!(
                tenant = %tenant_id,
                item_id = %d.item_id(),
                kind = d.kind(),
                detail = ?d,
                "stock discrepancy open"
            ),
        }
    }
}
