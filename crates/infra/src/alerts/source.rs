use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use shopfloor_core::TenantId;
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{Batch, BatchId, InventoryItem, InventoryItemId};

use super::{AlertError, AlertSource, StockAlert};
use crate::event_store::EventStore;
use crate::ledger::{ConsistencyChecker, DiscrepancyLog};
use crate::projections::{BatchReadModel, StockProjection, StockReadModel};
use crate::read_model::TenantStore;

/// Low stock from the projection plus a consistency check, for every tenant
/// with events in the store.
///
/// Each run first catches the projection up with the store, so events written
/// by other processes are seen. Only streams whose head is past the
/// projection's cursor are read, and only from that cursor on.
#[derive(Debug)]
pub struct LedgerAlertSource<S, B, IS, BS, L>
where
    IS: TenantStore<InventoryItemId, StockReadModel>,
    BS: TenantStore<BatchId, BatchReadModel>,
{
    store: S,
    projection: Arc<StockProjection<IS, BS>>,
    checker: Arc<ConsistencyChecker<S, B, IS, BS, L>>,
}

impl<S, B, IS, BS, L> LedgerAlertSource<S, B, IS, BS, L>
where
    IS: TenantStore<InventoryItemId, StockReadModel>,
    BS: TenantStore<BatchId, BatchReadModel>,
{
    pub fn new(
        store: S,
        projection: Arc<StockProjection<IS, BS>>,
        checker: Arc<ConsistencyChecker<S, B, IS, BS, L>>,
    ) -> Self {
        Self {
            store,
            projection,
            checker,
        }
    }
}

impl<S, B, IS, BS, L> LedgerAlertSource<S, B, IS, BS, L>
where
    S: EventStore,
    IS: TenantStore<InventoryItemId, StockReadModel>,
    BS: TenantStore<BatchId, BatchReadModel>,
{
    async fn catch_up(&self, tenant_id: TenantId) -> Result<usize, AlertError> {
        let mut applied = 0;
        for aggregate_type in [InventoryItem::AGGREGATE_TYPE, Batch::AGGREGATE_TYPE] {
            for (aggregate_id, head) in self.store.stream_heads(tenant_id, aggregate_type).await? {
                let cursor = self.projection.cursor(tenant_id, aggregate_id)?;
                if head <= cursor {
                    continue;
                }
                for stored in self.store.load_stream_after(tenant_id, aggregate_id, cursor).await? {
                    self.projection.apply_envelope(&stored.to_envelope())?;
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            debug!(%tenant_id, applied, "projection caught up with the store");
        }
        Ok(applied)
    }
}

#[async_trait]
impl<S, B, IS, BS, L> AlertSource for LedgerAlertSource<S, B, IS, BS, L>
where
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
    IS: TenantStore<InventoryItemId, StockReadModel> + 'static,
    BS: TenantStore<BatchId, BatchReadModel> + 'static,
    L: DiscrepancyLog + 'static,
{
    async fn collect(&self) -> Result<Vec<(TenantId, StockAlert)>, AlertError> {
        let mut alerts = Vec::new();
        for tenant_id in self.store.tenants().await? {
            self.catch_up(tenant_id).await?;

            for row in self.projection.low_stock(tenant_id) {
                let Some(minimum) = row.minimum_stock else {
                    continue;
                };
                alerts.push((
                    tenant_id,
                    StockAlert::LowStock {
                        item_id: row.item_id,
                        code: row.code,
                        available: row.levels.available(),
                        minimum,
                    },
                ));
            }

            let report = self.checker.check_tenant(tenant_id).await?;
            alerts.extend(
                report
                    .discrepancies
                    .into_iter()
                    .map(|d| (tenant_id, StockAlert::Discrepancy(d))),
            );
        }
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shopfloor_core::Quantity;
    use shopfloor_events::InMemoryEventBus;
    use shopfloor_inventory::{ReceiptState, SourceDocument, SourceKind};

    use crate::command_dispatcher::CommandDispatcher;
    use crate::event_store::InMemoryEventStore;
    use crate::ledger::{Discrepancy, InMemoryDiscrepancyLog, NewItem, StockLedger};
    use crate::read_model::InMemoryTenantStore;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Items = Arc<InMemoryTenantStore<InventoryItemId, StockReadModel>>;
    type Batches = Arc<InMemoryTenantStore<BatchId, BatchReadModel>>;

    #[tokio::test]
    async fn reports_low_stock_and_drift() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let ledger = StockLedger::new(Arc::new(CommandDispatcher::new(store.clone(), bus)));
        let items: Items = Arc::new(InMemoryTenantStore::new());
        let batches: Batches = Arc::new(InMemoryTenantStore::new());
        let projection = Arc::new(StockProjection::new(items.clone(), batches));
        let checker = Arc::new(ConsistencyChecker::new(
            ledger.clone(),
            projection.clone(),
            Arc::new(InMemoryDiscrepancyLog::new()),
        ));
        let source = LedgerAlertSource::new(store, projection.clone(), checker);

        let tenant_id = TenantId::new();
        let grn = SourceDocument::new(SourceKind::Grn, "GRN-0007").unwrap();
        let low = ledger
            .register_item(
                tenant_id,
                NewItem {
                    code: "BRK-100".to_string(),
                    name: "Bracket".to_string(),
                    unit_of_measure: "nos".to_string(),
                    minimum_stock: Some(Quantity::from(50)),
                },
            )
            .await
            .unwrap();
        ledger
            .receive_external(tenant_id, low, ReceiptState::Raw, Quantity::from(20), grn.clone())
            .await
            .unwrap();
        let healthy = ledger
            .register_item(
                tenant_id,
                NewItem {
                    code: "SHF-200".to_string(),
                    name: "Shaft".to_string(),
                    unit_of_measure: "nos".to_string(),
                    minimum_stock: Some(Quantity::from(5)),
                },
            )
            .await
            .unwrap();
        ledger
            .receive_external(tenant_id, healthy, ReceiptState::Finished, Quantity::from(30), grn)
            .await
            .unwrap();
        while let Ok(env) = sub.try_recv() {
            projection.apply_envelope(&env).unwrap();
        }

        let alerts = source.collect().await.unwrap();
        assert_eq!(
            alerts,
            vec![(
                tenant_id,
                StockAlert::LowStock {
                    item_id: low,
                    code: "BRK-100".to_string(),
                    available: Quantity::from(20),
                    minimum: Quantity::from(50),
                }
            )]
        );

        // Everything was already applied from the bus.
        assert_eq!(source.catch_up(tenant_id).await.unwrap(), 0);

        items.remove(tenant_id, &healthy);
        let alerts = source.collect().await.unwrap();
        assert!(alerts.contains(&(
            tenant_id,
            StockAlert::Discrepancy(Discrepancy::MissingReadModel { item_id: healthy })
        )));
    }

    #[tokio::test]
    async fn catch_up_reads_only_unseen_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let ledger = StockLedger::new(Arc::new(CommandDispatcher::new(store.clone(), bus)));
        let items: Items = Arc::new(InMemoryTenantStore::new());
        let batches: Batches = Arc::new(InMemoryTenantStore::new());
        let projection = Arc::new(StockProjection::new(items, batches));
        let checker = Arc::new(ConsistencyChecker::new(
            ledger.clone(),
            projection.clone(),
            Arc::new(InMemoryDiscrepancyLog::new()),
        ));
        let source = LedgerAlertSource::new(store, projection.clone(), checker);

        let tenant_id = TenantId::new();
        let grn = SourceDocument::new(SourceKind::Grn, "GRN-0008").unwrap();
        let item_id = ledger
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
        // The registration reaches the projection; the receipts do not.
        projection.apply_envelope(&sub.try_recv().unwrap()).unwrap();
        for qty in [10, 15] {
            ledger
                .receive_external(tenant_id, item_id, ReceiptState::Raw, Quantity::from(qty), grn.clone())
                .await
                .unwrap();
        }

        assert_eq!(source.catch_up(tenant_id).await.unwrap(), 2);
        assert_eq!(projection.cursor(tenant_id, item_id.aggregate_id()).unwrap(), 3);
        assert_eq!(projection.get(tenant_id, &item_id).unwrap().levels.raw(), Quantity::from(25));
        assert_eq!(source.catch_up(tenant_id).await.unwrap(), 0);
    }
}
