use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, Completion, DomainError, DomainResult, Lifecycle, Quantity,
    TenantId, aggregate_id_newtype,
};
use shopfloor_events::Event;
use shopfloor_inventory::{InventoryItemId, ReceiptState};

aggregate_id_newtype!(
    /// Purchase order identifier.
    PurchaseOrderId
);

/// Purchase order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Draft,
    Sent,
    PartiallyReceived,
    Received,
    /// Short-closed with quantities still outstanding.
    Closed,
    Cancelled,
}

impl Lifecycle for PurchaseOrderStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (PurchaseOrderStatus::Draft, PurchaseOrderStatus::Sent),
        (PurchaseOrderStatus::Draft, PurchaseOrderStatus::Cancelled),
        (PurchaseOrderStatus::Sent, PurchaseOrderStatus::PartiallyReceived),
        (PurchaseOrderStatus::Sent, PurchaseOrderStatus::Received),
        (PurchaseOrderStatus::Sent, PurchaseOrderStatus::Cancelled),
        (PurchaseOrderStatus::PartiallyReceived, PurchaseOrderStatus::Received),
        (PurchaseOrderStatus::PartiallyReceived, PurchaseOrderStatus::Closed),
    ];

    fn label(self) -> &'static str {
        match self {
            PurchaseOrderStatus::Draft => "draft",
            PurchaseOrderStatus::Sent => "sent",
            PurchaseOrderStatus::PartiallyReceived => "partially_received",
            PurchaseOrderStatus::Received => "received",
            PurchaseOrderStatus::Closed => "closed",
            PurchaseOrderStatus::Cancelled => "cancelled",
        }
    }
}

impl PurchaseOrderStatus {
    pub fn accepts_receipts(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Sent | PurchaseOrderStatus::PartiallyReceived
        )
    }
}

/// Purchase order line with its receipt progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    pub line_no: u32,
    pub item_id: InventoryItemId,
    /// Where received stock is booked.
    pub destination: ReceiptState,
    pub progress: Completion,
}

impl PurchaseOrderLine {
    pub fn quantity_ordered(&self) -> Quantity {
        self.progress.expected()
    }

    pub fn quantity_received(&self) -> Quantity {
        self.progress.received()
    }
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: Option<TenantId>,
    order_number: String,
    supplier: String,
    status: PurchaseOrderStatus,
    lines: Vec<PurchaseOrderLine>,
    version: u64,
    created: bool,
}

impl PurchaseOrder {
    pub const AGGREGATE_TYPE: &'static str = "purchasing.order";

    /// Not-yet-created instance for rehydration.
    pub fn empty(id: PurchaseOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            order_number: String::new(),
            supplier: String::new(),
            status: PurchaseOrderStatus::Draft,
            lines: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn supplier(&self) -> &str {
        &self.supplier
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[PurchaseOrderLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&PurchaseOrderLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    /// Receipt progress across every line.
    pub fn completion(&self) -> Completion {
        let mut total = Completion::new(self.lines.iter().map(|l| l.quantity_ordered()).sum());
        total.record(self.lines.iter().map(|l| l.quantity_received()).sum());
        total
    }

    fn status_after_receipts(&self) -> PurchaseOrderStatus {
        if self.lines.iter().all(|l| l.progress.is_complete()) {
            PurchaseOrderStatus::Received
        } else {
            PurchaseOrderStatus::PartiallyReceived
        }
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub order_number: String,
    pub supplier: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine (only allowed in Draft).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    #[serde(default)]
    pub destination: ReceiptState,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SendPurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordReceipt. Accepted quantity from a posted GRN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReceipt {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub quantity: Quantity,
    pub grn_number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelPurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPurchaseOrder {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShortClose. Stop expecting the outstanding quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortClose {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderCommand {
    CreatePurchaseOrder(CreatePurchaseOrder),
    AddLine(AddLine),
    Send(SendPurchaseOrder),
    RecordReceipt(RecordReceipt),
    Cancel(CancelPurchaseOrder),
    ShortClose(ShortClose),
}

/// Event: PurchaseOrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCreated {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub order_number: String,
    pub supplier: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderLineAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLineAdded {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    #[serde(default)]
    pub destination: ReceiptState,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderSent {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReceiptRecorded.
///
/// The matching stock receipt is a separate `StockMoved` on the item, appended
/// in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecorded {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub line_no: u32,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    pub grn_number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderCancelled {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseOrderClosed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderClosed {
    pub tenant_id: TenantId,
    pub order_id: PurchaseOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseOrderEvent {
    PurchaseOrderCreated(PurchaseOrderCreated),
    PurchaseOrderLineAdded(PurchaseOrderLineAdded),
    PurchaseOrderSent(PurchaseOrderSent),
    ReceiptRecorded(ReceiptRecorded),
    PurchaseOrderCancelled(PurchaseOrderCancelled),
    PurchaseOrderClosed(PurchaseOrderClosed),
}

impl Event for PurchaseOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(_) => "purchasing.order.created",
            PurchaseOrderEvent::PurchaseOrderLineAdded(_) => "purchasing.order.line_added",
            PurchaseOrderEvent::PurchaseOrderSent(_) => "purchasing.order.sent",
            PurchaseOrderEvent::ReceiptRecorded(_) => "purchasing.order.receipt_recorded",
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => "purchasing.order.cancelled",
            PurchaseOrderEvent::PurchaseOrderClosed(_) => "purchasing.order.closed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderSent(e) => e.occurred_at,
            PurchaseOrderEvent::ReceiptRecorded(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderCancelled(e) => e.occurred_at,
            PurchaseOrderEvent::PurchaseOrderClosed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseOrder {
    type Command = PurchaseOrderCommand;
    type Event = PurchaseOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseOrderEvent::PurchaseOrderCreated(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.order_number = e.order_number.clone();
                self.supplier = e.supplier.clone();
                self.status = PurchaseOrderStatus::Draft;
                self.lines.clear();
                self.created = true;
            }
            PurchaseOrderEvent::PurchaseOrderLineAdded(e) => {
                self.lines.push(PurchaseOrderLine {
                    line_no: e.line_no,
                    item_id: e.item_id,
                    destination: e.destination.clone(),
                    progress: Completion::new(e.quantity),
                });
            }
            PurchaseOrderEvent::PurchaseOrderSent(_) => {
                self.status = PurchaseOrderStatus::Sent;
            }
            PurchaseOrderEvent::ReceiptRecorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                    line.progress.record(e.quantity);
                }
                self.status = self.status_after_receipts();
            }
            PurchaseOrderEvent::PurchaseOrderCancelled(_) => {
                self.status = PurchaseOrderStatus::Cancelled;
            }
            PurchaseOrderEvent::PurchaseOrderClosed(_) => {
                self.status = PurchaseOrderStatus::Closed;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseOrderCommand::CreatePurchaseOrder(cmd) => self.handle_create(cmd),
            PurchaseOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            PurchaseOrderCommand::Send(cmd) => self.handle_send(cmd),
            PurchaseOrderCommand::RecordReceipt(cmd) => self.handle_receipt(cmd),
            PurchaseOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
            PurchaseOrderCommand::ShortClose(cmd) => self.handle_short_close(cmd),
        }
    }
}

impl PurchaseOrder {
    fn ensure_existing(&self, tenant_id: TenantId, order_id: PurchaseOrderId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePurchaseOrder) -> DomainResult<Vec<PurchaseOrderEvent>> {
        if self.created {
            return Err(DomainError::conflict("purchase order already exists"));
        }
        if cmd.order_number.trim().is_empty() {
            return Err(DomainError::validation("order number cannot be empty"));
        }
        if cmd.supplier.trim().is_empty() {
            return Err(DomainError::validation("supplier cannot be empty"));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCreated(
            PurchaseOrderCreated {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                order_number: cmd.order_number.trim().to_string(),
                supplier: cmd.supplier.trim().to_string(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> DomainResult<Vec<PurchaseOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;

        if self.status != PurchaseOrderStatus::Draft {
            return Err(DomainError::invariant(
                "lines can only be added while the order is a draft",
            ));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("quantity must be positive"));
        }

        let next_line_no = (self.lines.len() as u32) + 1;
        Ok(vec![PurchaseOrderEvent::PurchaseOrderLineAdded(
            PurchaseOrderLineAdded {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                line_no: next_line_no,
                item_id: cmd.item_id,
                quantity: cmd.quantity,
                destination: cmd.destination.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_send(&self, cmd: &SendPurchaseOrder) -> DomainResult<Vec<PurchaseOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.status.transition_to(PurchaseOrderStatus::Sent)?;

        if self.lines.is_empty() {
            return Err(DomainError::validation(
                "cannot send a purchase order without lines",
            ));
        }

        Ok(vec![PurchaseOrderEvent::PurchaseOrderSent(PurchaseOrderSent {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receipt(&self, cmd: &RecordReceipt) -> DomainResult<Vec<PurchaseOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;

        if !self.status.accepts_receipts() {
            return Err(DomainError::invariant(format!(
                "cannot receive against a {} purchase order",
                self.status.label()
            )));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("receipt quantity must be positive"));
        }

        let line = self
            .line(cmd.line_no)
            .ok_or_else(|| DomainError::validation(format!("unknown line {}", cmd.line_no)))?;
        line.progress.ensure_accepts(cmd.quantity)?;

        // Transition check against the status the receipt will produce.
        let mut preview = self.clone();
        if let Some(l) = preview.lines.iter_mut().find(|l| l.line_no == cmd.line_no) {
            l.progress.record(cmd.quantity);
        }
        let next = preview.status_after_receipts();
        if next != self.status {
            self.status.transition_to(next)?;
        }

        Ok(vec![PurchaseOrderEvent::ReceiptRecorded(ReceiptRecorded {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            line_no: line.line_no,
            item_id: line.item_id,
            quantity: cmd.quantity,
            grn_number: cmd.grn_number.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelPurchaseOrder) -> DomainResult<Vec<PurchaseOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.status.transition_to(PurchaseOrderStatus::Cancelled)?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderCancelled(
            PurchaseOrderCancelled {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_short_close(&self, cmd: &ShortClose) -> DomainResult<Vec<PurchaseOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.status.transition_to(PurchaseOrderStatus::Closed)?;

        Ok(vec![PurchaseOrderEvent::PurchaseOrderClosed(
            PurchaseOrderClosed {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
