use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use shopfloor_core::{AggregateId, Quantity, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{BatchId, InventoryItemId, StockLevels, StockPosting};
use shopfloor_production::{
    BillOfMaterials, CancelProduction, CompleteProduction, ConsumeMaterial, IssueMaterial,
    PlanProduction, ProductionOrder, ProductionOrderCommand, ProductionOrderEvent,
    ProductionOrderId, RecordOutput, Shortage,
};

use super::{book, load_document};
use crate::command_dispatcher::DispatchError;
use crate::event_store::{EventStore, StreamAppend};
use crate::ledger::StockLedger;

fn make_production(_: TenantId, id: AggregateId) -> ProductionOrder {
    ProductionOrder::empty(ProductionOrderId::new(id))
}

/// Production orders against a bill of materials.
#[derive(Debug)]
pub struct ProductionService<S, B> {
    ledger: StockLedger<S, B>,
}

impl<S, B> ProductionService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(ledger: StockLedger<S, B>) -> Self {
        Self { ledger }
    }

    /// Raw-material shortages for building `planned` units of `bom`.
    pub async fn check_availability(
        &self,
        tenant_id: TenantId,
        bom: &BillOfMaterials,
        planned: Quantity,
    ) -> Result<Vec<Shortage>, DispatchError> {
        let mut raw: HashMap<InventoryItemId, Quantity> = HashMap::new();
        for component in bom.components() {
            let levels = self.ledger.stock_levels(tenant_id, component.item_id).await?;
            raw.insert(component.item_id, levels.raw());
        }
        Ok(bom.shortages(planned, |id| raw.get(&id).copied().unwrap_or_default())?)
    }

    /// Shortages for what an order still has to issue.
    pub async fn shortages_for_order(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
    ) -> Result<Vec<Shortage>, DispatchError> {
        let order = self.order(tenant_id, order_id).await?;
        let mut shortages = Vec::new();
        for req in order.requirements()? {
            let still_needed = req.required.saturating_sub(order.issued(req.item_id));
            if still_needed.is_zero() {
                continue;
            }
            let available = self.ledger.stock_levels(tenant_id, req.item_id).await?.raw();
            let shortage = still_needed.saturating_sub(available);
            if !shortage.is_zero() {
                shortages.push(Shortage {
                    item_id: req.item_id,
                    required: still_needed,
                    available,
                    shortage,
                });
            }
        }
        Ok(shortages)
    }

    /// Plan an order. The output and every component must be registered.
    pub async fn plan(
        &self,
        tenant_id: TenantId,
        order_number: &str,
        bom: BillOfMaterials,
        planned_quantity: Quantity,
    ) -> Result<ProductionOrderId, DispatchError> {
        self.ledger.item(tenant_id, bom.output_item()).await?;
        for component in bom.components() {
            self.ledger.item(tenant_id, component.item_id).await?;
        }

        let order_id = ProductionOrderId::generate();
        let cmd = ProductionOrderCommand::Plan(PlanProduction {
            tenant_id,
            order_id,
            order_number: order_number.to_string(),
            bom,
            planned_quantity,
            occurred_at: Utc::now(),
        });
        self.ledger
            .dispatcher()
            .dispatch(tenant_id, order_id.aggregate_id(), ProductionOrder::AGGREGATE_TYPE, cmd, make_production)
            .await?;
        Ok(order_id)
    }

    /// Issue a component from raw into its process WIP.
    pub async fn issue_material(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        item_id: InventoryItemId,
        quantity: Quantity,
    ) -> Result<StockLevels, DispatchError> {
        let occurred_at = Utc::now();
        let (append, postings) = self
            .decide(tenant_id, order_id, issue(tenant_id, order_id, item_id, quantity, occurred_at))
            .await?;
        last_levels(book(&self.ledger, tenant_id, append, postings, occurred_at).await?)
    }

    /// Issue a component drawing from its batches, oldest first.
    pub async fn issue_material_fifo(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        item_id: InventoryItemId,
        quantity: Quantity,
    ) -> Result<(StockLevels, Vec<(BatchId, Quantity)>), DispatchError> {
        let occurred_at = Utc::now();
        let (append, postings) = self
            .decide(tenant_id, order_id, issue(tenant_id, order_id, item_id, quantity, occurred_at))
            .await?;

        let mut appends: Vec<StreamAppend> = append.into_iter().collect();
        let mut result = None;
        for posting in &postings {
            let planned = self
                .ledger
                .decide_fifo_posting(tenant_id, posting, occurred_at)
                .await?;
            appends.extend(planned.appends);
            result = Some((planned.levels, planned.allocations));
        }

        self.ledger.dispatcher().commit(appends).await?;
        result.ok_or_else(|| DispatchError::InvariantViolation("issue booked no movement".to_string()))
    }

    /// Consume issued WIP into the output.
    pub async fn consume_material(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        item_id: InventoryItemId,
        quantity: Quantity,
    ) -> Result<StockLevels, DispatchError> {
        let occurred_at = Utc::now();
        let cmd = ProductionOrderCommand::ConsumeMaterial(ConsumeMaterial {
            tenant_id,
            order_id,
            item_id,
            quantity,
            occurred_at,
        });
        let (append, postings) = self.decide(tenant_id, order_id, cmd).await?;
        last_levels(book(&self.ledger, tenant_id, append, postings, occurred_at).await?)
    }

    /// Record good and damaged output. Good units go to finished stock;
    /// damaged units are only counted on the order.
    ///
    /// Returns the output item's levels, or `None` when nothing good was made.
    pub async fn record_output(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        good: Quantity,
        damaged: Quantity,
    ) -> Result<Option<StockLevels>, DispatchError> {
        let occurred_at = Utc::now();
        let cmd = ProductionOrderCommand::RecordOutput(RecordOutput {
            tenant_id,
            order_id,
            good,
            damaged,
            occurred_at,
        });
        let (append, postings) = self.decide(tenant_id, order_id, cmd).await?;
        Ok(book(&self.ledger, tenant_id, append, postings, occurred_at)
            .await?
            .into_iter()
            .last())
    }

    pub async fn complete(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
    ) -> Result<(), DispatchError> {
        let cmd = ProductionOrderCommand::Complete(CompleteProduction {
            tenant_id,
            order_id,
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, order_id, cmd).await
    }

    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let cmd = ProductionOrderCommand::Cancel(CancelProduction {
            tenant_id,
            order_id,
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, order_id, cmd).await
    }

    pub async fn order(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
    ) -> Result<ProductionOrder, DispatchError> {
        load_document(
            &self.ledger,
            tenant_id,
            order_id.aggregate_id(),
            make_production,
            ProductionOrder::is_planned,
        )
        .await
    }

    async fn decide(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        cmd: ProductionOrderCommand,
    ) -> Result<(Option<StreamAppend>, Vec<StockPosting>), DispatchError> {
        let decided = self
            .ledger
            .dispatcher()
            .decide(tenant_id, order_id.aggregate_id(), ProductionOrder::AGGREGATE_TYPE, cmd, make_production)
            .await?;
        let (_, events, append) = decided.into_parts();
        let postings = events
            .iter()
            .filter_map(ProductionOrderEvent::stock_posting)
            .collect();
        Ok((append, postings))
    }

    async fn run(
        &self,
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        cmd: ProductionOrderCommand,
    ) -> Result<(), DispatchError> {
        self.ledger
            .dispatcher()
            .dispatch(tenant_id, order_id.aggregate_id(), ProductionOrder::AGGREGATE_TYPE, cmd, make_production)
            .await?;
        Ok(())
    }
}

fn issue(
    tenant_id: TenantId,
    order_id: ProductionOrderId,
    item_id: InventoryItemId,
    quantity: Quantity,
    occurred_at: DateTime<Utc>,
) -> ProductionOrderCommand {
    ProductionOrderCommand::IssueMaterial(IssueMaterial {
        tenant_id,
        order_id,
        item_id,
        quantity,
        occurred_at,
    })
}

fn last_levels(levels: Vec<StockLevels>) -> Result<StockLevels, DispatchError> {
    levels
        .into_iter()
        .last()
        .ok_or_else(|| DispatchError::InvariantViolation("production step booked no movement".to_string()))
}
