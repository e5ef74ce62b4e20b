use chrono::Utc;
use serde_json::Value as JsonValue;

use shopfloor_core::{AggregateId, Quantity, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{InventoryItemId, ReceiptState};
use shopfloor_purchasing::{
    AddLine, CancelPurchaseOrder, CreatePurchaseOrder, PurchaseOrder, PurchaseOrderCommand,
    PurchaseOrderId, SendPurchaseOrder, ShortClose,
};

use super::load_document;
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::ledger::StockLedger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseLine {
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    /// State the received material is booked into.
    pub destination: ReceiptState,
}

pub(crate) fn make_order(_: TenantId, id: AggregateId) -> PurchaseOrder {
    PurchaseOrder::empty(PurchaseOrderId::new(id))
}

/// Purchase orders. Receipts arrive through [`super::ReceivingService`].
#[derive(Debug)]
pub struct PurchasingService<S, B> {
    ledger: StockLedger<S, B>,
}

impl<S, B> PurchasingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(ledger: StockLedger<S, B>) -> Self {
        Self { ledger }
    }

    /// Create a draft order with its lines. Every line item must be registered.
    pub async fn create_order(
        &self,
        tenant_id: TenantId,
        order_number: &str,
        supplier: &str,
        lines: Vec<PurchaseLine>,
    ) -> Result<PurchaseOrderId, DispatchError> {
        for line in &lines {
            self.ledger.item(tenant_id, line.item_id).await?;
        }

        let order_id = PurchaseOrderId::generate();
        let occurred_at = Utc::now();
        let mut commands = vec![PurchaseOrderCommand::CreatePurchaseOrder(CreatePurchaseOrder {
            tenant_id,
            order_id,
            order_number: order_number.to_string(),
            supplier: supplier.to_string(),
            occurred_at,
        })];
        commands.extend(lines.into_iter().map(|line| {
            PurchaseOrderCommand::AddLine(AddLine {
                tenant_id,
                order_id,
                item_id: line.item_id,
                quantity: line.quantity,
                destination: line.destination,
                occurred_at,
            })
        }));

        let decided = self
            .ledger
            .dispatcher()
            .decide_all(tenant_id, order_id.aggregate_id(), PurchaseOrder::AGGREGATE_TYPE, commands, make_order)
            .await?;
        self.ledger.dispatcher().commit(decided.into_parts().2).await?;
        Ok(order_id)
    }

    pub async fn send(&self, tenant_id: TenantId, order_id: PurchaseOrderId) -> Result<(), DispatchError> {
        let cmd = PurchaseOrderCommand::Send(SendPurchaseOrder {
            tenant_id,
            order_id,
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, order_id, cmd).await
    }

    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let cmd = PurchaseOrderCommand::Cancel(CancelPurchaseOrder {
            tenant_id,
            order_id,
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, order_id, cmd).await
    }

    /// Close a partially received order; the outstanding quantity is dropped.
    pub async fn short_close(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let cmd = PurchaseOrderCommand::ShortClose(ShortClose {
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
        order_id: PurchaseOrderId,
    ) -> Result<PurchaseOrder, DispatchError> {
        load_document(&self.ledger, tenant_id, order_id.aggregate_id(), make_order, |o: &PurchaseOrder| {
            o.tenant_id().is_some()
        })
        .await
    }

    async fn run(
        &self,
        tenant_id: TenantId,
        order_id: PurchaseOrderId,
        cmd: PurchaseOrderCommand,
    ) -> Result<(), DispatchError> {
        self.ledger
            .dispatcher()
            .dispatch(tenant_id, order_id.aggregate_id(), PurchaseOrder::AGGREGATE_TYPE, cmd, make_order)
            .await?;
        Ok(())
    }
}
