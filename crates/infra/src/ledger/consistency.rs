//! Ledger vs read model consistency checks.
//!
//! The event log is authoritative. The checker replays it, compares the result
//! with the stock projection and flags every divergence for review. Nothing is
//! corrected automatically; [`ConsistencyChecker::reconcile`] is the explicit
//! administrative repair.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use shopfloor_core::{Quantity, TenantId, UserId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{BatchId, InventoryItem, InventoryItemId, StockLevels, StockState};

use crate::command_dispatcher::DispatchError;
use crate::event_store::{EventStore, EventStoreError};
use crate::event_store::postgres::map_sqlx_error;
use crate::ledger::service::StockLedger;
use crate::projections::{BatchReadModel, ProjectionError, StockProjection, StockReadModel};
use crate::read_model::TenantStore;

/// A divergence found by the checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Stored quantity differs from the ledger replay.
    QuantityMismatch {
        item_id: InventoryItemId,
        state: StockState,
        stored: Quantity,
        ledger: Quantity,
    },
    /// The ledger has an item the read model does not.
    MissingReadModel { item_id: InventoryItemId },
    /// The item's batches together hold more than the item in one state.
    BatchExceedsItem {
        item_id: InventoryItemId,
        state: StockState,
        batches: Quantity,
        item: Quantity,
    },
    /// A recorded movement withdrew more than its bucket held at that point.
    LedgerOverdrawn {
        item_id: InventoryItemId,
        sequence_number: u64,
        state: StockState,
        available: Quantity,
        requested: Quantity,
    },
}

impl Discrepancy {
    pub fn item_id(&self) -> InventoryItemId {
        match self {
            Discrepancy::QuantityMismatch { item_id, .. }
            | Discrepancy::MissingReadModel { item_id }
            | Discrepancy::BatchExceedsItem { item_id, .. }
            | Discrepancy::LedgerOverdrawn { item_id, .. } => *item_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Discrepancy::QuantityMismatch { .. } => "quantity_mismatch",
            Discrepancy::MissingReadModel { .. } => "missing_read_model",
            Discrepancy::BatchExceedsItem { .. } => "batch_exceeds_item",
            Discrepancy::LedgerOverdrawn { .. } => "ledger_overdrawn",
        }
    }
}

/// A flagged discrepancy awaiting review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscrepancyRecord {
    pub discrepancy_id: Uuid,
    pub tenant_id: TenantId,
    pub discrepancy: Discrepancy,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

impl DiscrepancyRecord {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("discrepancy log error: {0}")]
    Log(String),
}

/// Review queue for flagged discrepancies.
///
/// Recording the same open finding twice is a no-op, so a periodic check does
/// not pile up duplicates.
#[async_trait]
pub trait DiscrepancyLog: Send + Sync {
    /// Flag discrepancies; returns only the newly opened records.
    async fn record(
        &self,
        tenant_id: TenantId,
        discrepancies: &[Discrepancy],
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<DiscrepancyRecord>, ConsistencyError>;

    async fn open(&self, tenant_id: TenantId) -> Result<Vec<DiscrepancyRecord>, ConsistencyError>;

    /// Mark every open record of an item resolved; returns how many were closed.
    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize, ConsistencyError>;
}

#[async_trait]
impl<L> DiscrepancyLog for Arc<L>
where
    L: DiscrepancyLog + ?Sized,
{
    async fn record(
        &self,
        tenant_id: TenantId,
        discrepancies: &[Discrepancy],
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        (**self).record(tenant_id, discrepancies, detected_at).await
    }

    async fn open(&self, tenant_id: TenantId) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        (**self).open(tenant_id).await
    }

    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize, ConsistencyError> {
        (**self).resolve(tenant_id, item_id, resolved_by, resolved_at).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDiscrepancyLog {
    records: RwLock<Vec<DiscrepancyRecord>>,
}

impl InMemoryDiscrepancyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<DiscrepancyRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }
}

fn poisoned() -> ConsistencyError {
    ConsistencyError::Log("lock poisoned".to_string())
}

#[async_trait]
impl DiscrepancyLog for InMemoryDiscrepancyLog {
    async fn record(
        &self,
        tenant_id: TenantId,
        discrepancies: &[Discrepancy],
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let mut opened = Vec::new();

        for d in discrepancies {
            let duplicate = records
                .iter()
                .any(|r| r.tenant_id == tenant_id && r.is_open() && &r.discrepancy == d);
            if duplicate {
                continue;
            }
            let record = DiscrepancyRecord {
                discrepancy_id: Uuid::now_v7(),
                tenant_id,
                discrepancy: d.clone(),
                detected_at,
                resolved_at: None,
                resolved_by: None,
            };
            records.push(record.clone());
            opened.push(record);
        }

        Ok(opened)
    }

    async fn open(&self, tenant_id: TenantId) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.is_open())
            .cloned()
            .collect())
    }

    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize, ConsistencyError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let mut closed = 0;
        for r in records.iter_mut() {
            if r.tenant_id == tenant_id && r.is_open() && r.discrepancy.item_id() == item_id {
                r.resolved_at = Some(resolved_at);
                r.resolved_by = Some(resolved_by);
                closed += 1;
            }
        }
        Ok(closed)
    }
}

/// `stock_discrepancies` table.
#[derive(Debug, Clone)]
pub struct PostgresDiscrepancyLog {
    pool: PgPool,
}

impl PostgresDiscrepancyLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscrepancyLog for PostgresDiscrepancyLog {
    #[instrument(skip(self, discrepancies), fields(tenant_id = %tenant_id.as_uuid()), err)]
    async fn record(
        &self,
        tenant_id: TenantId,
        discrepancies: &[Discrepancy],
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        let mut opened = Vec::new();

        for d in discrepancies {
            let detail = serde_json::to_value(d)
                .map_err(|e| ConsistencyError::Log(format!("failed to encode discrepancy: {e}")))?;
            let discrepancy_id = Uuid::now_v7();

            let result = sqlx::query(
                r#"
                INSERT INTO stock_discrepancies (discrepancy_id, tenant_id, item_id, kind, detail, detected_at)
                SELECT $1, $2, $3, $4, $5, $6
                WHERE NOT EXISTS (
                    SELECT 1 FROM stock_discrepancies
                    WHERE tenant_id = $2 AND item_id = $3 AND detail = $5 AND resolved_at IS NULL
                )
                "#,
            )
            .bind(discrepancy_id)
            .bind(tenant_id.as_uuid())
            .bind(d.item_id().aggregate_id().as_uuid())
            .bind(d.kind())
            .bind(&detail)
            .bind(detected_at)
            .execute(&self.pool)
            .await
            .map_err(|e| ConsistencyError::Store(map_sqlx_error("record_discrepancy", e)))?;

            if result.rows_affected() == 1 {
                opened.push(DiscrepancyRecord {
                    discrepancy_id,
                    tenant_id,
                    discrepancy: d.clone(),
                    detected_at,
                    resolved_at: None,
                    resolved_by: None,
                });
            }
        }

        Ok(opened)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid()), err)]
    async fn open(&self, tenant_id: TenantId) -> Result<Vec<DiscrepancyRecord>, ConsistencyError> {
        let rows = sqlx::query(
            r#"
            SELECT discrepancy_id, detail, detected_at
            FROM stock_discrepancies
            WHERE tenant_id = $1 AND resolved_at IS NULL
            ORDER BY detected_at, discrepancy_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ConsistencyError::Store(map_sqlx_error("open_discrepancies", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let decode = |e: sqlx::Error| ConsistencyError::Log(format!("failed to decode row: {e}"));
            let detail: JsonValue = row.try_get("detail").map_err(decode)?;
            let discrepancy: Discrepancy = serde_json::from_value(detail)
                .map_err(|e| ConsistencyError::Log(format!("failed to decode discrepancy: {e}")))?;
            records.push(DiscrepancyRecord {
                discrepancy_id: row.try_get("discrepancy_id").map_err(decode)?,
                tenant_id,
                discrepancy,
                detected_at: row.try_get("detected_at").map_err(decode)?,
                resolved_at: None,
                resolved_by: None,
            });
        }
        Ok(records)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid()), err)]
    async fn resolve(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        resolved_by: UserId,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize, ConsistencyError> {
        let result = sqlx::query(
            r#"
            UPDATE stock_discrepancies
            SET resolved_at = $4, resolved_by = $3
            WHERE tenant_id = $1 AND item_id = $2 AND resolved_at IS NULL
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(item_id.aggregate_id().as_uuid())
        .bind(resolved_by.as_uuid())
        .bind(resolved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ConsistencyError::Store(map_sqlx_error("resolve_discrepancies", e)))?;

        Ok(result.rows_affected() as usize)
    }
}

/// Outcome of a tenant-wide check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub items_checked: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl CheckReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Levels folded from an item's movement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReplay {
    /// Replayed levels; an overdrawn withdrawal only empties its bucket.
    pub levels: StockLevels,
    /// One [`Discrepancy::LedgerOverdrawn`] per offending entry.
    pub overdrawn: Vec<Discrepancy>,
}

/// Compares the stock projection with the ledger.
#[derive(Debug)]
pub struct ConsistencyChecker<S, B, IS, BS, L>
where
    IS: TenantStore<InventoryItemId, StockReadModel>,
    BS: TenantStore<BatchId, BatchReadModel>,
{
    ledger: StockLedger<S, B>,
    projection: Arc<StockProjection<IS, BS>>,
    log: L,
}

impl<S, B, IS, BS, L> ConsistencyChecker<S, B, IS, BS, L>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    IS: TenantStore<InventoryItemId, StockReadModel>,
    BS: TenantStore<BatchId, BatchReadModel>,
    L: DiscrepancyLog,
{
    pub fn new(ledger: StockLedger<S, B>, projection: Arc<StockProjection<IS, BS>>, log: L) -> Self {
        Self {
            ledger,
            projection,
            log,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Replay the item's movement records into fresh levels, noting every
    /// entry that withdrew more than was there.
    pub async fn recompute_from_ledger(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<LedgerReplay, ConsistencyError> {
        let mut levels = StockLevels::new();
        let mut overdrawn = Vec::new();
        for record in self.ledger.movement_history(tenant_id, item_id).await? {
            if levels.try_apply(&record.movement).is_err() {
                if let Some(state) = record.movement.from.clone() {
                    overdrawn.push(Discrepancy::LedgerOverdrawn {
                        item_id,
                        sequence_number: record.sequence_number,
                        available: levels.get(&state),
                        requested: record.movement.quantity,
                        state,
                    });
                }
                levels.apply(&record.movement);
            }
        }
        Ok(LedgerReplay { levels, overdrawn })
    }

    /// Compare one item and flag what differs.
    pub async fn check_item(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<Discrepancy>, ConsistencyError> {
        let LedgerReplay {
            levels: ledger,
            overdrawn,
        } = self.recompute_from_ledger(tenant_id, item_id).await?;
        let mut found = overdrawn;

        match self.projection.get(tenant_id, &item_id) {
            None => found.push(Discrepancy::MissingReadModel { item_id }),
            Some(stored) => {
                for state in state_union(&[&stored.levels, &ledger]) {
                    let stored_qty = stored.levels.get(&state);
                    let ledger_qty = ledger.get(&state);
                    if stored_qty != ledger_qty {
                        found.push(Discrepancy::QuantityMismatch {
                            item_id,
                            state,
                            stored: stored_qty,
                            ledger: ledger_qty,
                        });
                    }
                }
            }
        }

        let batches = self.ledger.batches_of_item(tenant_id, item_id).await?;
        if !batches.is_empty() {
            let batch_levels: Vec<&StockLevels> = batches.iter().map(|b| b.levels()).collect();
            for state in state_union(&batch_levels) {
                let in_batches: Quantity = batch_levels.iter().map(|l| l.get(&state)).sum();
                let on_item = ledger.get(&state);
                if in_batches > on_item {
                    found.push(Discrepancy::BatchExceedsItem {
                        item_id,
                        state,
                        batches: in_batches,
                        item: on_item,
                    });
                }
            }
        }

        for d in &found {
            warn!(
                tenant_id = %tenant_id,
                item_id = %item_id,
                kind = d.kind(),
                detail = ?d,
                "stock discrepancy flagged for review"
            );
        }
        if !found.is_empty() {
            self.log.record(tenant_id, &found, Utc::now()).await?;
        }

        Ok(found)
    }

    /// Check every item of a tenant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn check_tenant(&self, tenant_id: TenantId) -> Result<CheckReport, ConsistencyError> {
        let ids = self
            .ledger
            .dispatcher()
            .store()
            .list_streams(tenant_id, InventoryItem::AGGREGATE_TYPE)
            .await?;

        let mut report = CheckReport::default();
        for id in ids {
            let found = self.check_item(tenant_id, InventoryItemId::new(id)).await?;
            report.items_checked += 1;
            report.discrepancies.extend(found);
        }

        if report.is_consistent() {
            info!(items = report.items_checked, "stock ledger consistent");
        }
        Ok(report)
    }

    /// Rebuild the item's (and its batches') read model from the ledger and
    /// close its open flags. Returns the number of flags closed.
    pub async fn reconcile(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        resolved_by: UserId,
    ) -> Result<usize, ConsistencyError> {
        let store = self.ledger.dispatcher().store();

        let stream = store.load_stream(tenant_id, item_id.aggregate_id()).await?;
        self.projection.rebuild_stream(
            tenant_id,
            item_id.aggregate_id(),
            stream.iter().map(|e| e.to_envelope()),
        )?;

        for batch in self.ledger.batches_of_item(tenant_id, item_id).await? {
            let batch_id = batch.id_typed().aggregate_id();
            let stream = store.load_stream(tenant_id, batch_id).await?;
            self.projection
                .rebuild_stream(tenant_id, batch_id, stream.iter().map(|e| e.to_envelope()))?;
        }

        let closed = self
            .log
            .resolve(tenant_id, item_id, resolved_by, Utc::now())
            .await?;
        info!(tenant_id = %tenant_id, item_id = %item_id, %resolved_by, closed, "stock read model reconciled");
        Ok(closed)
    }
}

fn state_union(levels: &[&StockLevels]) -> BTreeSet<StockState> {
    let mut states: BTreeSet<StockState> = [StockState::Raw, StockState::Finished, StockState::Scrap]
        .into_iter()
        .collect();
    for l in levels {
        states.extend(l.states().into_iter().map(|(s, _)| s));
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;

    use shopfloor_core::{AggregateId, ExpectedVersion};
    use shopfloor_events::InMemoryEventBus;
    use shopfloor_inventory::{
        Batch, BatchEvent, BatchNumber, BatchStockMoved, InventoryEvent, MovementRequest,
        ProcessName, QualityStatus, ReceiptState, SourceDocument, SourceKind, StockMovement,
        StockMoved, StockPosting,
    };

    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};
    use crate::ledger::service::{NewBatch, NewItem};
    use crate::read_model::InMemoryTenantStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Items = Arc<InMemoryTenantStore<InventoryItemId, StockReadModel>>;
    type Batches = Arc<InMemoryTenantStore<BatchId, BatchReadModel>>;

    struct Fixture {
        ledger: StockLedger<Arc<InMemoryEventStore>, Bus>,
        items: Items,
        projection: Arc<StockProjection<Items, Batches>>,
        checker: ConsistencyChecker<Arc<InMemoryEventStore>, Bus, Items, Batches, Arc<InMemoryDiscrepancyLog>>,
        log: Arc<InMemoryDiscrepancyLog>,
        bus: Bus,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryEventStore::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let dispatcher = Arc::new(CommandDispatcher::new(store, bus.clone()));
            let ledger = StockLedger::new(dispatcher);
            let items: Items = Arc::new(InMemoryTenantStore::new());
            let projection = Arc::new(StockProjection::new(items.clone(), Arc::new(InMemoryTenantStore::new())));
            let log = Arc::new(InMemoryDiscrepancyLog::new());
            let checker = ConsistencyChecker::new(ledger.clone(), projection.clone(), log.clone());
            Self {
                ledger,
                items,
                projection,
                checker,
                log,
                bus,
            }
        }

        async fn stocked_item(&self, tenant_id: TenantId) -> InventoryItemId {
            let sub = self.bus.subscribe();
            let item_id = self
                .ledger
                .register_item(
                    tenant_id,
                    NewItem {
                        code: "BRK-100".to_string(),
                        name: "Bracket".to_string(),
                        unit_of_measure: "nos".to_string(),
                        minimum_stock: None,
                    },
                )
                .await
                .unwrap();
            self.ledger
                .receive_external(tenant_id, item_id, ReceiptState::Raw, Quantity::from(100), grn())
                .await
                .unwrap();
            self.ledger
                .move_to_wip(tenant_id, item_id, ProcessName::new("cutting").unwrap(), Quantity::from(40), grn())
                .await
                .unwrap();
            while let Ok(env) = sub.try_recv() {
                self.projection.apply_envelope(&env).unwrap();
            }
            item_id
        }
    }

    fn grn() -> SourceDocument {
        SourceDocument::new(SourceKind::Grn, "GRN-0001").unwrap()
    }

    #[tokio::test]
    async fn replay_matches_projection_when_nothing_drifted() {
        let fx = Fixture::new();
        let tenant_id = TenantId::new();
        let item_id = fx.stocked_item(tenant_id).await;

        let replay = fx.checker.recompute_from_ledger(tenant_id, item_id).await.unwrap();
        assert_eq!(replay.levels.raw(), Quantity::from(60));
        assert!(replay.overdrawn.is_empty());

        let report = fx.checker.check_tenant(tenant_id).await.unwrap();
        assert_eq!(report.items_checked, 1);
        assert!(report.is_consistent());
        assert!(fx.log.all().is_empty());
    }

    #[tokio::test]
    async fn drift_is_flagged_once_and_not_corrected() {
        let fx = Fixture::new();
        let tenant_id = TenantId::new();
        let item_id = fx.stocked_item(tenant_id).await;

        // Simulate a stale row: raw reads 100 instead of 60.
        let mut row = fx.items.get(tenant_id, &item_id).unwrap();
        row.levels.apply(&shopfloor_inventory::StockMovement {
            from: None,
            to: Some(StockState::Raw),
            quantity: Quantity::from(40),
            source: grn(),
        });
        fx.items.upsert(tenant_id, item_id, row);

        let found = fx.checker.check_item(tenant_id, item_id).await.unwrap();
        assert_eq!(
            found,
            vec![Discrepancy::QuantityMismatch {
                item_id,
                state: StockState::Raw,
                stored: Quantity::from(100),
                ledger: Quantity::from(60),
            }]
        );
        fx.checker.check_item(tenant_id, item_id).await.unwrap();

        assert_eq!(fx.log.open(tenant_id).await.unwrap().len(), 1);
        assert_eq!(fx.projection.get(tenant_id, &item_id).unwrap().levels.raw(), Quantity::from(100));
    }

    #[tokio::test]
    async fn reconcile_rebuilds_and_resolves() {
        let fx = Fixture::new();
        let tenant_id = TenantId::new();
        let item_id = fx.stocked_item(tenant_id).await;
        fx.items.remove(tenant_id, &item_id);

        let found = fx.checker.check_item(tenant_id, item_id).await.unwrap();
        assert_eq!(found, vec![Discrepancy::MissingReadModel { item_id }]);

        let admin = UserId::new();
        let closed = fx.checker.reconcile(tenant_id, item_id, admin).await.unwrap();
        assert_eq!(closed, 1);
        assert!(fx.log.open(tenant_id).await.unwrap().is_empty());
        assert_eq!(fx.log.all()[0].resolved_by, Some(admin));
        assert!(fx.checker.check_item(tenant_id, item_id).await.unwrap().is_empty());
    }

    /// Append an event straight to a stream, bypassing every aggregate check.
    async fn force_append<E>(fx: &Fixture, tenant_id: TenantId, aggregate_id: AggregateId, aggregate_type: &str, event: &E) -> EventEnvelope<JsonValue>
    where
        E: shopfloor_events::Event + Serialize,
    {
        let store = fx.ledger.dispatcher().store();
        let version = store.load_stream(tenant_id, aggregate_id).await.unwrap().len() as u64;
        let stored = store
            .append(
                vec![UncommittedEvent::from_typed(tenant_id, aggregate_id, aggregate_type, Uuid::now_v7(), event).unwrap()],
                ExpectedVersion::Exact(version),
            )
            .await
            .unwrap();
        stored[0].to_envelope()
    }

    #[tokio::test]
    async fn overdrawn_entry_is_reported_not_absorbed() {
        let fx = Fixture::new();
        let tenant_id = TenantId::new();
        let item_id = fx.stocked_item(tenant_id).await;

        let corrupt = InventoryEvent::StockMoved(StockMoved {
            tenant_id,
            item_id,
            movement: StockMovement {
                from: Some(StockState::Raw),
                to: None,
                quantity: Quantity::from(500),
                source: grn(),
            },
            occurred_at: Utc::now(),
        });
        let env = force_append(&fx, tenant_id, item_id.aggregate_id(), InventoryItem::AGGREGATE_TYPE, &corrupt).await;
        fx.projection.apply_envelope(&env).unwrap();

        let replay = fx.checker.recompute_from_ledger(tenant_id, item_id).await.unwrap();
        assert_eq!(replay.levels.raw(), Quantity::ZERO);

        let overdrawn = Discrepancy::LedgerOverdrawn {
            item_id,
            sequence_number: env.sequence_number(),
            state: StockState::Raw,
            available: Quantity::from(60),
            requested: Quantity::from(500),
        };
        let found = fx.checker.check_item(tenant_id, item_id).await.unwrap();
        assert_eq!(found, vec![overdrawn.clone()]);

        let open = fx.log.open(tenant_id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].discrepancy, overdrawn);
        assert_eq!(open[0].discrepancy.kind(), "ledger_overdrawn");
    }

    #[tokio::test]
    async fn batches_never_exceed_their_item() {
        let fx = Fixture::new();
        let tenant_id = TenantId::new();
        let item_id = fx.stocked_item(tenant_id).await;

        let posting = StockPosting::new(
            item_id,
            MovementRequest::ReceiveExternal {
                state: ReceiptState::Raw,
                quantity: Quantity::from(10),
            },
            grn(),
        );
        let (batch_id, planned) = fx
            .ledger
            .decide_new_batch(
                tenant_id,
                item_id,
                NewBatch {
                    batch_number: Some(BatchNumber::new("BRK-2410-001").unwrap()),
                    origin: grn(),
                    quality: QualityStatus::Good,
                    expiry_date: None,
                },
                Some(&posting),
                Utc::now(),
            )
            .await
            .unwrap();
        fx.ledger.dispatcher().commit(planned.appends).await.unwrap();
        assert_eq!(fx.ledger.stock_levels(tenant_id, item_id).await.unwrap().raw(), Quantity::from(70));
        let found = fx.checker.check_item(tenant_id, item_id).await.unwrap();
        assert!(found.iter().all(|d| d.kind() != "batch_exceeds_item"), "{found:?}");

        // A batch movement written without its item counterpart.
        let stray = BatchEvent::StockMoved(BatchStockMoved {
            tenant_id,
            batch_id,
            item_id,
            movement: StockMovement {
                from: None,
                to: Some(StockState::Raw),
                quantity: Quantity::from(65),
                source: grn(),
            },
            occurred_at: Utc::now(),
        });
        force_append(&fx, tenant_id, batch_id.aggregate_id(), Batch::AGGREGATE_TYPE, &stray).await;

        let found: Vec<_> = fx
            .checker
            .check_item(tenant_id, item_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.kind() == "batch_exceeds_item")
            .collect();
        assert_eq!(
            found,
            vec![Discrepancy::BatchExceedsItem {
                item_id,
                state: StockState::Raw,
                batches: Quantity::from(75),
                item: Quantity::from(70),
            }]
        );
    }
}
