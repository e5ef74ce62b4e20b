use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, Completion, Decimal, DomainError, DomainResult, Lifecycle,
    Quantity, TenantId, aggregate_id_newtype,
};
use shopfloor_events::Event;
use shopfloor_inventory::{
    BatchNumber, InventoryItemId, MovementRequest, ProcessName, ReceiptState, SourceDocument,
    SourceKind, StockPosting,
};
use shopfloor_jobwork::JobWorkId;
use shopfloor_purchasing::PurchaseOrderId;

aggregate_id_newtype!(
    /// Goods receipt note identifier.
    GoodsReceiptId
);

/// What the goods were received against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReceiptSource {
    PurchaseOrder {
        order_id: PurchaseOrderId,
        line_no: u32,
    },
    /// Material coming back from a job-work vendor, still in that process's WIP.
    JobWork {
        job_id: JobWorkId,
        process: ProcessName,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrnStatus {
    PendingInspection,
    Inspected,
    Posted,
    Rejected,
}

impl Lifecycle for GrnStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (GrnStatus::PendingInspection, GrnStatus::Inspected),
        (GrnStatus::PendingInspection, GrnStatus::Rejected),
        (GrnStatus::Inspected, GrnStatus::Posted),
    ];

    fn label(self) -> &'static str {
        match self {
            GrnStatus::PendingInspection => "pending_inspection",
            GrnStatus::Inspected => "inspected",
            GrnStatus::Posted => "posted",
            GrnStatus::Rejected => "rejected",
        }
    }
}

/// Aggregate root: GoodsReceipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodsReceipt {
    id: GoodsReceiptId,
    tenant_id: Option<TenantId>,
    grn_number: String,
    source: Option<ReceiptSource>,
    item_id: Option<InventoryItemId>,
    received: Quantity,
    passed: Quantity,
    rejected: Quantity,
    batch_number: Option<BatchNumber>,
    expiry_date: Option<NaiveDate>,
    destination: ReceiptState,
    remarks: Option<String>,
    status: GrnStatus,
    version: u64,
    created: bool,
}

impl GoodsReceipt {
    pub const AGGREGATE_TYPE: &'static str = "receiving.grn";

    pub fn empty(id: GoodsReceiptId) -> Self {
        Self {
            id,
            tenant_id: None,
            grn_number: String::new(),
            source: None,
            item_id: None,
            received: Quantity::ZERO,
            passed: Quantity::ZERO,
            rejected: Quantity::ZERO,
            batch_number: None,
            expiry_date: None,
            destination: ReceiptState::Raw,
            remarks: None,
            status: GrnStatus::PendingInspection,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> GoodsReceiptId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_recorded(&self) -> bool {
        self.created
    }

    pub fn grn_number(&self) -> &str {
        &self.grn_number
    }

    pub fn source(&self) -> Option<&ReceiptSource> {
        self.source.as_ref()
    }

    pub fn item_id(&self) -> Option<InventoryItemId> {
        self.item_id
    }

    pub fn received(&self) -> Quantity {
        self.received
    }

    pub fn passed(&self) -> Quantity {
        self.passed
    }

    pub fn rejected(&self) -> Quantity {
        self.rejected
    }

    pub fn batch_number(&self) -> Option<&BatchNumber> {
        self.batch_number.as_ref()
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        self.expiry_date
    }

    /// State passed purchase stock is booked into.
    pub fn destination(&self) -> &ReceiptState {
        &self.destination
    }

    pub fn remarks(&self) -> Option<&str> {
        self.remarks.as_deref()
    }

    pub fn status(&self) -> GrnStatus {
        self.status
    }

    /// Passed share of the received quantity, in percent. `None` before inspection.
    pub fn acceptance_rate(&self) -> Option<Decimal> {
        match self.status {
            GrnStatus::Inspected | GrnStatus::Posted => {
                let mut progress = Completion::new(self.received);
                progress.record(self.passed);
                Some(progress.percent())
            }
            GrnStatus::PendingInspection | GrnStatus::Rejected => None,
        }
    }
}

impl AggregateRoot for GoodsReceipt {
    type Id = GoodsReceiptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RecordGoodsReceipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGoodsReceipt {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub grn_number: String,
    pub source: ReceiptSource,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    /// Lot to open on posting. Purchase receipts only.
    pub batch_number: Option<BatchNumber>,
    pub expiry_date: Option<NaiveDate>,
    /// Material destination of the purchase order line. Purchase receipts only.
    #[serde(default)]
    pub destination: ReceiptState,
    pub occurred_at: DateTime<Utc>,
}

/// Command: InspectGoods. `passed + rejected` must equal the received quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectGoods {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub passed: Quantity,
    pub rejected: Quantity,
    pub remarks: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostGoodsReceipt {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectGoodsReceipt {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodsReceiptCommand {
    Record(RecordGoodsReceipt),
    Inspect(InspectGoods),
    Post(PostGoodsReceipt),
    Reject(RejectGoodsReceipt),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceived {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub grn_number: String,
    pub source: ReceiptSource,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    pub batch_number: Option<BatchNumber>,
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub destination: ReceiptState,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsInspected {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub passed: Quantity,
    pub rejected: Quantity,
    pub remarks: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: GoodsReceiptPosted. Carries everything the ledger posting needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceiptPosted {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub grn_number: String,
    pub source: ReceiptSource,
    pub item_id: InventoryItemId,
    pub passed: Quantity,
    pub rejected: Quantity,
    pub batch_number: Option<BatchNumber>,
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub destination: ReceiptState,
    pub occurred_at: DateTime<Utc>,
}

impl GoodsReceiptPosted {
    pub fn source_document(&self) -> SourceDocument {
        SourceDocument {
            kind: SourceKind::Grn,
            reference: self.grn_number.clone(),
        }
    }

    /// Purchase receipts add passed stock to the line's destination (raw
    /// unless the order says otherwise). Job-work receipts drain the process
    /// WIP into finished and scrap.
    pub fn stock_posting(&self) -> StockPosting {
        let request = match &self.source {
            ReceiptSource::PurchaseOrder { .. } => MovementRequest::ReceiveExternal {
                state: self.destination.clone(),
                quantity: self.passed,
            },
            ReceiptSource::JobWork { process, .. } => MovementRequest::ReceiveFromWip {
                process: process.clone(),
                passed: self.passed,
                scrap: self.rejected,
            },
        };
        StockPosting::new(self.item_id, request, self.source_document())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoodsReceiptRejected {
    pub tenant_id: TenantId,
    pub grn_id: GoodsReceiptId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodsReceiptEvent {
    GoodsReceived(GoodsReceived),
    GoodsInspected(GoodsInspected),
    GoodsReceiptPosted(GoodsReceiptPosted),
    GoodsReceiptRejected(GoodsReceiptRejected),
}

impl Event for GoodsReceiptEvent {
    fn event_type(&self) -> &'static str {
        match self {
            GoodsReceiptEvent::GoodsReceived(_) => "receiving.grn.received",
            GoodsReceiptEvent::GoodsInspected(_) => "receiving.grn.inspected",
            GoodsReceiptEvent::GoodsReceiptPosted(_) => "receiving.grn.posted",
            GoodsReceiptEvent::GoodsReceiptRejected(_) => "receiving.grn.rejected",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            GoodsReceiptEvent::GoodsReceived(e) => e.occurred_at,
            GoodsReceiptEvent::GoodsInspected(e) => e.occurred_at,
            GoodsReceiptEvent::GoodsReceiptPosted(e) => e.occurred_at,
            GoodsReceiptEvent::GoodsReceiptRejected(e) => e.occurred_at,
        }
    }
}

impl Aggregate for GoodsReceipt {
    type Command = GoodsReceiptCommand;
    type Event = GoodsReceiptEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            GoodsReceiptEvent::GoodsReceived(e) => {
                self.id = e.grn_id;
                self.tenant_id = Some(e.tenant_id);
                self.grn_number = e.grn_number.clone();
                self.source = Some(e.source.clone());
                self.item_id = Some(e.item_id);
                self.received = e.quantity;
                self.batch_number = e.batch_number.clone();
                self.expiry_date = e.expiry_date;
                self.destination = e.destination.clone();
                self.status = GrnStatus::PendingInspection;
                self.created = true;
            }
            GoodsReceiptEvent::GoodsInspected(e) => {
                self.passed = e.passed;
                self.rejected = e.rejected;
                self.remarks = e.remarks.clone();
                self.status = GrnStatus::Inspected;
            }
            GoodsReceiptEvent::GoodsReceiptPosted(_) => {
                self.status = GrnStatus::Posted;
            }
            GoodsReceiptEvent::GoodsReceiptRejected(e) => {
                self.rejected = self.received;
                self.remarks = Some(e.reason.clone());
                self.status = GrnStatus::Rejected;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            GoodsReceiptCommand::Record(cmd) => self.handle_record(cmd),
            GoodsReceiptCommand::Inspect(cmd) => self.handle_inspect(cmd),
            GoodsReceiptCommand::Post(cmd) => self.handle_post(cmd),
            GoodsReceiptCommand::Reject(cmd) => self.handle_reject(cmd),
        }
    }
}

impl GoodsReceipt {
    fn ensure_existing(&self, tenant_id: TenantId, grn_id: GoodsReceiptId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != grn_id {
            return Err(DomainError::invariant("grn_id mismatch"));
        }
        Ok(())
    }

    fn handle_record(&self, cmd: &RecordGoodsReceipt) -> DomainResult<Vec<GoodsReceiptEvent>> {
        if self.created {
            return Err(DomainError::conflict("goods receipt already recorded"));
        }
        if cmd.grn_number.trim().is_empty() {
            return Err(DomainError::validation("GRN number cannot be empty"));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("received quantity must be positive"));
        }
        if matches!(cmd.source, ReceiptSource::JobWork { .. }) {
            if cmd.batch_number.is_some() {
                return Err(DomainError::validation(
                    "job work receipts cannot open a new batch",
                ));
            }
            if cmd.destination != ReceiptState::Raw {
                return Err(DomainError::validation(
                    "job work receipts always land in finished and scrap",
                ));
            }
        }

        Ok(vec![GoodsReceiptEvent::GoodsReceived(GoodsReceived {
            tenant_id: cmd.tenant_id,
            grn_id: cmd.grn_id,
            grn_number: cmd.grn_number.trim().to_string(),
            source: cmd.source.clone(),
            item_id: cmd.item_id,
            quantity: cmd.quantity,
            batch_number: cmd.batch_number.clone(),
            expiry_date: cmd.expiry_date,
            destination: cmd.destination.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_inspect(&self, cmd: &InspectGoods) -> DomainResult<Vec<GoodsReceiptEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.grn_id)?;
        self.status.transition_to(GrnStatus::Inspected)?;

        if cmd.passed + cmd.rejected != self.received {
            return Err(DomainError::validation(format!(
                "passed ({}) + rejected ({}) must equal received ({})",
                cmd.passed, cmd.rejected, self.received
            )));
        }

        Ok(vec![GoodsReceiptEvent::GoodsInspected(GoodsInspected {
            tenant_id: cmd.tenant_id,
            grn_id: cmd.grn_id,
            passed: cmd.passed,
            rejected: cmd.rejected,
            remarks: cmd.remarks.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_post(&self, cmd: &PostGoodsReceipt) -> DomainResult<Vec<GoodsReceiptEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.grn_id)?;
        self.status.transition_to(GrnStatus::Posted)?;

        let (Some(source), Some(item_id)) = (self.source.clone(), self.item_id) else {
            return Err(DomainError::invariant("recorded GRN without source"));
        };

        Ok(vec![GoodsReceiptEvent::GoodsReceiptPosted(
            GoodsReceiptPosted {
                tenant_id: cmd.tenant_id,
                grn_id: cmd.grn_id,
                grn_number: self.grn_number.clone(),
                source,
                item_id,
                passed: self.passed,
                rejected: self.rejected,
                batch_number: self.batch_number.clone(),
                expiry_date: self.expiry_date,
                destination: self.destination.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_reject(&self, cmd: &RejectGoodsReceipt) -> DomainResult<Vec<GoodsReceiptEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.grn_id)?;
        self.status.transition_to(GrnStatus::Rejected)?;

        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("rejection reason cannot be empty"));
        }

        Ok(vec![GoodsReceiptEvent::GoodsReceiptRejected(
            GoodsReceiptRejected {
                tenant_id: cmd.tenant_id,
                grn_id: cmd.grn_id,
                reason: cmd.reason.trim().to_string(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
