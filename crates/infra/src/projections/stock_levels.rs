use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use shopfloor_core::{AggregateId, Quantity, TenantId};
use shopfloor_events::EventEnvelope;
use shopfloor_inventory::{
    Batch, BatchEvent, BatchId, BatchNumber, InventoryEvent, InventoryItem, InventoryItemId,
    QualityStatus, SourceDocument, StockLevels,
};

use crate::read_model::TenantStore;

/// Current stock of one item, per state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReadModel {
    pub item_id: InventoryItemId,
    pub code: String,
    pub name: String,
    pub unit_of_measure: String,
    pub minimum_stock: Option<Quantity>,
    pub levels: StockLevels,
    pub last_movement_at: Option<DateTime<Utc>>,
}

impl StockReadModel {
    fn placeholder(item_id: InventoryItemId) -> Self {
        Self {
            item_id,
            code: String::new(),
            name: String::new(),
            unit_of_measure: String::new(),
            minimum_stock: None,
            levels: StockLevels::new(),
            last_movement_at: None,
        }
    }

    /// Available stock (raw + finished) at or below a positive reorder level.
    pub fn is_low_stock(&self) -> bool {
        match self.minimum_stock {
            Some(min) if !min.is_zero() => self.levels.available() <= min,
            _ => false,
        }
    }
}

/// Current stock of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReadModel {
    pub batch_id: BatchId,
    pub item_id: InventoryItemId,
    pub batch_number: BatchNumber,
    pub origin: SourceDocument,
    pub quality: QualityStatus,
    pub expiry_date: Option<NaiveDate>,
    pub opened_at: DateTime<Utc>,
    pub levels: StockLevels,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct CursorKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize ledger event: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("batch event for unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("projection lock poisoned: {0}")]
    Poisoned(String),
}

fn poisoned<T>(_: T) -> ProjectionError {
    ProjectionError::Poisoned("stream cursors".to_string())
}

/// Stock projection over item and batch streams.
///
/// Consumes published envelopes and keeps one row per item and one per batch.
/// Envelopes of other aggregate types are ignored. Idempotent for
/// at-least-once delivery: replays at or below the stream cursor are skipped.
#[derive(Debug)]
pub struct StockProjection<S, B>
where
    S: TenantStore<InventoryItemId, StockReadModel>,
    B: TenantStore<BatchId, BatchReadModel>,
{
    items: S,
    batches: B,
    cursors: RwLock<HashMap<CursorKey, u64>>,
}

impl<S, B> StockProjection<S, B>
where
    S: TenantStore<InventoryItemId, StockReadModel>,
    B: TenantStore<BatchId, BatchReadModel>,
{
    pub fn new(items: S, batches: B) -> Self {
        Self {
            items,
            batches,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, tenant_id: TenantId, item_id: &InventoryItemId) -> Option<StockReadModel> {
        self.items.get(tenant_id, item_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<StockReadModel> {
        let mut rows = self.items.list(tenant_id);
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        rows
    }

    pub fn low_stock(&self, tenant_id: TenantId) -> Vec<StockReadModel> {
        self.list(tenant_id)
            .into_iter()
            .filter(StockReadModel::is_low_stock)
            .collect()
    }

    pub fn batch(&self, tenant_id: TenantId, batch_id: &BatchId) -> Option<BatchReadModel> {
        self.batches.get(tenant_id, batch_id)
    }

    /// Batches of an item, oldest first.
    pub fn batches_for_item(&self, tenant_id: TenantId, item_id: InventoryItemId) -> Vec<BatchReadModel> {
        let mut rows: Vec<_> = self
            .batches
            .list(tenant_id)
            .into_iter()
            .filter(|b| b.item_id == item_id)
            .collect();
        rows.sort_by_key(|b| (b.opened_at, b.batch_id));
        rows
    }

    /// Last sequence number applied for a stream; 0 when none was.
    pub fn cursor(&self, tenant_id: TenantId, aggregate_id: AggregateId) -> Result<u64, ProjectionError> {
        let cursors = self.cursors.read().map_err(poisoned)?;
        Ok(cursors
            .get(&CursorKey {
                tenant_id,
                aggregate_id,
            })
            .copied()
            .unwrap_or(0))
    }

    /// Apply a published envelope.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let is_item = envelope.is_from(InventoryItem::AGGREGATE_TYPE);
        if !is_item && !envelope.is_from(Batch::AGGREGATE_TYPE) {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = self.cursors.write().map_err(poisoned)?;
        let key = CursorKey {
            tenant_id,
            aggregate_id,
        };
        let last = cursors.get(&key).copied().unwrap_or(0);

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let decode_err = |e: serde_json::Error| ProjectionError::Deserialize(e.to_string());
        if is_item {
            let event: InventoryEvent = envelope.decode().map_err(decode_err)?;
            self.apply_item_event(tenant_id, aggregate_id, event)?;
        } else {
            let event: BatchEvent = envelope.decode().map_err(decode_err)?;
            self.apply_batch_event(tenant_id, aggregate_id, event)?;
        }

        cursors.insert(key, seq);
        Ok(())
    }

    fn apply_item_event(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        event: InventoryEvent,
    ) -> Result<(), ProjectionError> {
        if event.tenant_id() != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        let item_id = event.item_id();
        if item_id.aggregate_id() != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event item_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let mut row = self
            .items
            .get(tenant_id, &item_id)
            .unwrap_or_else(|| StockReadModel::placeholder(item_id));

        match event {
            InventoryEvent::ItemRegistered(e) => {
                row = StockReadModel {
                    item_id: e.item_id,
                    code: e.code,
                    name: e.name,
                    unit_of_measure: e.unit_of_measure,
                    minimum_stock: e.minimum_stock,
                    levels: StockLevels::new(),
                    last_movement_at: None,
                };
            }
            InventoryEvent::MinimumStockChanged(e) => {
                row.minimum_stock = e.minimum_stock;
            }
            InventoryEvent::StockMoved(e) => {
                row.levels.apply(&e.movement);
                row.last_movement_at = Some(e.occurred_at);
            }
            // Batch rows come from the batch stream.
            InventoryEvent::BatchRegistered(_) => {}
        }

        self.items.upsert(tenant_id, item_id, row);
        Ok(())
    }

    fn apply_batch_event(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        event: BatchEvent,
    ) -> Result<(), ProjectionError> {
        let (event_tenant, batch_id) = match &event {
            BatchEvent::BatchOpened(e) => (e.tenant_id, e.batch_id),
            BatchEvent::StockMoved(e) => (e.tenant_id, e.batch_id),
            BatchEvent::QualityStatusChanged(e) => (e.tenant_id, e.batch_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if batch_id.aggregate_id() != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event batch_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let row = match event {
            BatchEvent::BatchOpened(e) => BatchReadModel {
                batch_id: e.batch_id,
                item_id: e.item_id,
                batch_number: e.batch_number,
                origin: e.origin,
                quality: e.quality,
                expiry_date: e.expiry_date,
                opened_at: e.occurred_at,
                levels: StockLevels::new(),
            },
            BatchEvent::StockMoved(e) => {
                let mut row = self
                    .batches
                    .get(tenant_id, &batch_id)
                    .ok_or(ProjectionError::UnknownBatch(batch_id))?;
                row.levels.apply(&e.movement);
                row
            }
            BatchEvent::QualityStatusChanged(e) => {
                let mut row = self
                    .batches
                    .get(tenant_id, &batch_id)
                    .ok_or(ProjectionError::UnknownBatch(batch_id))?;
                row.quality = e.to;
                row
            }
        };

        self.batches.upsert(tenant_id, batch_id, row);
        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.cursors.write().map_err(poisoned)?.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();

        let mut tenants = envs.iter().map(|e| e.tenant_id()).collect::<Vec<_>>();
        tenants.sort();
        tenants.dedup();
        for t in tenants {
            self.items.clear_tenant(t);
            self.batches.clear_tenant(t);
        }

        // Deterministic replay order: tenant, aggregate, sequence.
        envs.sort_by_key(|e| (e.tenant_id(), e.aggregate_id(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }

    /// Drop and replay a single item or batch stream.
    pub fn rebuild_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        self.cursors.write().map_err(poisoned)?.remove(&CursorKey {
            tenant_id,
            aggregate_id,
        });
        self.items.remove(tenant_id, &InventoryItemId::new(aggregate_id));
        self.batches.remove(tenant_id, &BatchId::new(aggregate_id));

        let mut envs: Vec<_> = envelopes
            .into_iter()
            .filter(|e| e.tenant_id() == tenant_id && e.aggregate_id() == aggregate_id)
            .collect();
        envs.sort_by_key(|e| e.sequence_number());

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
