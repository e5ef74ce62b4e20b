use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use shopfloor_core::{AggregateId, Quantity, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{InventoryItemId, ProcessName, StockLevels};
use shopfloor_jobwork::{
    AdvanceJobWorkStage, IssueJobWork, JobWork, JobWorkCommand, JobWorkEvent, JobWorkId,
    RecordUnusedReturn,
};

use super::{book, load_document};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::ledger::StockLedger;

pub(crate) fn make_job(_: TenantId, id: AggregateId) -> JobWork {
    JobWork::empty(JobWorkId::new(id))
}

/// Material sent to outside vendors for one process or a sequence of them.
///
/// Issue moves raw to the first process's WIP and unused returns move it
/// back. Each hand-over moves WIP on to the next process. Finished and scrap
/// come back from the last process through a goods receipt.
#[derive(Debug)]
pub struct JobWorkService<S, B> {
    ledger: StockLedger<S, B>,
}

impl<S, B> JobWorkService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(ledger: StockLedger<S, B>) -> Self {
        Self { ledger }
    }

    pub async fn issue(
        &self,
        tenant_id: TenantId,
        job_number: &str,
        vendor: &str,
        item_id: InventoryItemId,
        process: ProcessName,
        quantity: Quantity,
    ) -> Result<(JobWorkId, StockLevels), DispatchError> {
        self.issue_sequence(tenant_id, job_number, vendor, item_id, vec![process], quantity)
            .await
    }

    /// Issue material for `processes`, worked in order.
    pub async fn issue_sequence(
        &self,
        tenant_id: TenantId,
        job_number: &str,
        vendor: &str,
        item_id: InventoryItemId,
        processes: Vec<ProcessName>,
        quantity: Quantity,
    ) -> Result<(JobWorkId, StockLevels), DispatchError> {
        let job_id = JobWorkId::generate();
        let occurred_at = Utc::now();
        let cmd = JobWorkCommand::Issue(IssueJobWork {
            tenant_id,
            job_id,
            job_number: job_number.to_string(),
            vendor: vendor.to_string(),
            item_id,
            processes,
            quantity,
            occurred_at,
        });
        let levels = self.run(tenant_id, job_id, cmd, occurred_at).await?;
        Ok((job_id, levels))
    }

    /// Hand `quantity` of the job's WIP at `from` on to the next process.
    pub async fn advance(
        &self,
        tenant_id: TenantId,
        job_id: JobWorkId,
        from: ProcessName,
        quantity: Quantity,
    ) -> Result<StockLevels, DispatchError> {
        let occurred_at = Utc::now();
        let cmd = JobWorkCommand::AdvanceStage(AdvanceJobWorkStage {
            tenant_id,
            job_id,
            from,
            quantity,
            occurred_at,
        });
        self.run(tenant_id, job_id, cmd, occurred_at).await
    }

    pub async fn return_unused(
        &self,
        tenant_id: TenantId,
        job_id: JobWorkId,
        quantity: Quantity,
    ) -> Result<StockLevels, DispatchError> {
        let occurred_at = Utc::now();
        let cmd = JobWorkCommand::RecordUnusedReturn(RecordUnusedReturn {
            tenant_id,
            job_id,
            quantity,
            occurred_at,
        });
        self.run(tenant_id, job_id, cmd, occurred_at).await
    }

    pub async fn job(&self, tenant_id: TenantId, job_id: JobWorkId) -> Result<JobWork, DispatchError> {
        load_document(&self.ledger, tenant_id, job_id.aggregate_id(), make_job, JobWork::is_issued).await
    }

    async fn run(
        &self,
        tenant_id: TenantId,
        job_id: JobWorkId,
        cmd: JobWorkCommand,
        occurred_at: DateTime<Utc>,
    ) -> Result<StockLevels, DispatchError> {
        let decided = self
            .ledger
            .dispatcher()
            .decide(tenant_id, job_id.aggregate_id(), JobWork::AGGREGATE_TYPE, cmd, make_job)
            .await?;
        let (_, events, append) = decided.into_parts();
        let postings = events.iter().filter_map(JobWorkEvent::stock_posting).collect();

        let levels = book(&self.ledger, tenant_id, append, postings, occurred_at).await?;
        levels
            .into_iter()
            .last()
            .ok_or_else(|| DispatchError::InvariantViolation("job work step booked no movement".to_string()))
    }
}
