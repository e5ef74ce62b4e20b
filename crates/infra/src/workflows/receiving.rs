use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use shopfloor_core::{AggregateId, Quantity, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{
    BatchId, BatchNumber, InventoryItemId, QualityStatus, ReceiptState, StockLevels,
};
use shopfloor_jobwork::{JobWork, JobWorkCommand, RecordJobWorkReceipt};
use shopfloor_purchasing::{PurchaseOrder, PurchaseOrderCommand, RecordReceipt};
use shopfloor_receiving::{
    GoodsReceipt, GoodsReceiptCommand, GoodsReceiptEvent, GoodsReceiptId, GoodsReceiptPosted,
    InspectGoods, PostGoodsReceipt, ReceiptSource, RecordGoodsReceipt, RejectGoodsReceipt,
};

use super::job_work::make_job;
use super::load_document;
use super::purchasing::make_order;
use crate::command_dispatcher::DispatchError;
use crate::event_store::{EventStore, StreamAppend};
use crate::ledger::{NewBatch, StockLedger};

fn make_grn(_: TenantId, id: AggregateId) -> GoodsReceipt {
    GoodsReceipt::empty(GoodsReceiptId::new(id))
}

/// A goods receipt to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGoodsReceipt {
    pub grn_number: String,
    pub source: ReceiptSource,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    pub batch_number: Option<BatchNumber>,
    pub expiry_date: Option<NaiveDate>,
}

/// Result of posting a goods receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedReceipt {
    pub grn_id: GoodsReceiptId,
    pub levels: StockLevels,
    /// Batch opened for a purchase receipt that carried a lot number or expiry.
    pub batch_id: Option<BatchId>,
}

/// Goods receipt notes with inspection.
///
/// Posting is the step that touches stock: the receipt, the originating
/// purchase order or job work and the ledger are committed together.
#[derive(Debug)]
pub struct ReceivingService<S, B> {
    ledger: StockLedger<S, B>,
}

impl<S, B> ReceivingService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(ledger: StockLedger<S, B>) -> Self {
        Self { ledger }
    }

    /// Record goods at the gate, pending inspection.
    ///
    /// The source document must expect this item and still accept receipts.
    pub async fn record(
        &self,
        tenant_id: TenantId,
        receipt: NewGoodsReceipt,
    ) -> Result<GoodsReceiptId, DispatchError> {
        let destination = self.ensure_source_accepts(tenant_id, &receipt).await?;

        let grn_id = GoodsReceiptId::generate();
        let cmd = GoodsReceiptCommand::Record(RecordGoodsReceipt {
            tenant_id,
            grn_id,
            grn_number: receipt.grn_number,
            source: receipt.source,
            item_id: receipt.item_id,
            quantity: receipt.quantity,
            batch_number: receipt.batch_number,
            expiry_date: receipt.expiry_date,
            destination,
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, grn_id, cmd).await?;
        Ok(grn_id)
    }

    pub async fn inspect(
        &self,
        tenant_id: TenantId,
        grn_id: GoodsReceiptId,
        passed: Quantity,
        rejected: Quantity,
        remarks: Option<String>,
    ) -> Result<(), DispatchError> {
        let cmd = GoodsReceiptCommand::Inspect(InspectGoods {
            tenant_id,
            grn_id,
            passed,
            rejected,
            remarks,
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, grn_id, cmd).await
    }

    /// Reject the whole receipt before inspection; nothing reaches stock.
    pub async fn reject(
        &self,
        tenant_id: TenantId,
        grn_id: GoodsReceiptId,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let cmd = GoodsReceiptCommand::Reject(RejectGoodsReceipt {
            tenant_id,
            grn_id,
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        });
        self.run(tenant_id, grn_id, cmd).await
    }

    /// Post an inspected receipt to stock.
    pub async fn post(
        &self,
        tenant_id: TenantId,
        grn_id: GoodsReceiptId,
    ) -> Result<PostedReceipt, DispatchError> {
        let occurred_at = Utc::now();
        let dispatcher = self.ledger.dispatcher();

        let decided = dispatcher
            .decide(
                tenant_id,
                grn_id.aggregate_id(),
                GoodsReceipt::AGGREGATE_TYPE,
                GoodsReceiptCommand::Post(PostGoodsReceipt {
                    tenant_id,
                    grn_id,
                    occurred_at,
                }),
                make_grn,
            )
            .await?;
        let (_, events, grn_append) = decided.into_parts();
        let posted = events
            .into_iter()
            .find_map(|e| match e {
                GoodsReceiptEvent::GoodsReceiptPosted(p) => Some(p),
                _ => None,
            })
            .ok_or_else(|| DispatchError::InvariantViolation("posting produced no event".to_string()))?;

        let mut appends: Vec<StreamAppend> = grn_append.into_iter().collect();
        appends.extend(self.decide_source_receipt(tenant_id, &posted, occurred_at).await?);

        let posting = posted.stock_posting();
        let wants_batch = posted.batch_number.is_some() || posted.expiry_date.is_some();
        let (batch_id, planned) = if matches!(posted.source, ReceiptSource::PurchaseOrder { .. })
            && wants_batch
            && !posted.passed.is_zero()
        {
            let (id, planned) = self
                .ledger
                .decide_new_batch(
                    tenant_id,
                    posted.item_id,
                    NewBatch {
                        batch_number: posted.batch_number.clone(),
                        origin: posted.source_document(),
                        quality: QualityStatus::Good,
                        expiry_date: posted.expiry_date,
                    },
                    Some(&posting),
                    occurred_at,
                )
                .await?;
            (Some(id), planned)
        } else {
            let planned = self
                .ledger
                .decide_posting(tenant_id, &posting, None, occurred_at)
                .await?;
            (None, planned)
        };
        appends.extend(planned.appends);

        dispatcher.commit(appends).await?;
        info!(
            tenant_id = %tenant_id,
            grn = %posted.grn_number,
            passed = %posted.passed,
            rejected = %posted.rejected,
            "goods receipt posted"
        );

        Ok(PostedReceipt {
            grn_id,
            levels: planned.levels,
            batch_id,
        })
    }

    pub async fn receipt(
        &self,
        tenant_id: TenantId,
        grn_id: GoodsReceiptId,
    ) -> Result<GoodsReceipt, DispatchError> {
        load_document(&self.ledger, tenant_id, grn_id.aggregate_id(), make_grn, GoodsReceipt::is_recorded)
            .await
    }

    /// Receipt recorded on the purchase order or job work the goods came from.
    async fn decide_source_receipt(
        &self,
        tenant_id: TenantId,
        posted: &GoodsReceiptPosted,
        occurred_at: DateTime<Utc>,
    ) -> Result<Option<StreamAppend>, DispatchError> {
        let dispatcher = self.ledger.dispatcher();
        match &posted.source {
            ReceiptSource::PurchaseOrder { order_id, line_no } => {
                // Rejected material is not received against the order.
                if posted.passed.is_zero() {
                    return Ok(None);
                }
                let cmd = PurchaseOrderCommand::RecordReceipt(RecordReceipt {
                    tenant_id,
                    order_id: *order_id,
                    line_no: *line_no,
                    quantity: posted.passed,
                    grn_number: posted.grn_number.clone(),
                    occurred_at,
                });
                let decided = dispatcher
                    .decide(tenant_id, order_id.aggregate_id(), PurchaseOrder::AGGREGATE_TYPE, cmd, make_order)
                    .await?;
                Ok(decided.into_parts().2)
            }
            ReceiptSource::JobWork { job_id, .. } => {
                let cmd = JobWorkCommand::RecordReceipt(RecordJobWorkReceipt {
                    tenant_id,
                    job_id: *job_id,
                    passed: posted.passed,
                    scrap: posted.rejected,
                    grn_number: posted.grn_number.clone(),
                    occurred_at,
                });
                let decided = dispatcher
                    .decide(tenant_id, job_id.aggregate_id(), JobWork::AGGREGATE_TYPE, cmd, make_job)
                    .await?;
                Ok(decided.into_parts().2)
            }
        }
    }

    /// Checks the source still expects the goods; returns where they land.
    async fn ensure_source_accepts(
        &self,
        tenant_id: TenantId,
        receipt: &NewGoodsReceipt,
    ) -> Result<ReceiptState, DispatchError> {
        match &receipt.source {
            ReceiptSource::PurchaseOrder { order_id, line_no } => {
                let order = load_document(&self.ledger, tenant_id, order_id.aggregate_id(), make_order, |o: &PurchaseOrder| {
                    o.tenant_id().is_some()
                })
                .await?;
                if !order.status().accepts_receipts() {
                    return Err(DispatchError::InvariantViolation(format!(
                        "purchase order {} does not accept receipts",
                        order.order_number()
                    )));
                }
                let line = order.line(*line_no).ok_or(DispatchError::NotFound)?;
                if line.item_id != receipt.item_id {
                    return Err(DispatchError::Validation(format!(
                        "line {line_no} of {} is for a different item",
                        order.order_number()
                    )));
                }
                if receipt.quantity > line.progress.outstanding() {
                    return Err(DispatchError::Validation(format!(
                        "received {} exceeds outstanding {} on line {line_no}",
                        receipt.quantity,
                        line.progress.outstanding()
                    )));
                }
                Ok(line.destination.clone())
            }
            ReceiptSource::JobWork { job_id, process } => {
                let job = load_document(&self.ledger, tenant_id, job_id.aggregate_id(), make_job, JobWork::is_issued)
                    .await?;
                if job.item_id() != Some(receipt.item_id) || job.final_process() != Some(process) {
                    return Err(DispatchError::Validation(format!(
                        "job work {} was issued for a different item or final process",
                        job.job_number()
                    )));
                }
                if receipt.quantity > job.held_at(process) {
                    return Err(DispatchError::Validation(format!(
                        "only {} of job work {} has reached {process}",
                        job.held_at(process),
                        job.job_number()
                    )));
                }
                if receipt.quantity > job.progress().outstanding() {
                    return Err(DispatchError::Validation(format!(
                        "received {} exceeds outstanding {} on job work {}",
                        receipt.quantity,
                        job.progress().outstanding(),
                        job.job_number()
                    )));
                }
                Ok(ReceiptState::Raw)
            }
        }
    }

    async fn run(
        &self,
        tenant_id: TenantId,
        grn_id: GoodsReceiptId,
        cmd: GoodsReceiptCommand,
    ) -> Result<(), DispatchError> {
        self.ledger
            .dispatcher()
            .dispatch(tenant_id, grn_id.aggregate_id(), GoodsReceipt::AGGREGATE_TYPE, cmd, make_grn)
            .await?;
        Ok(())
    }
}
