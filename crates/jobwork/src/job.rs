use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, Completion, DomainError, DomainResult, Lifecycle, Quantity,
    TenantId, aggregate_id_newtype,
};
use shopfloor_events::Event;
use shopfloor_inventory::{
    InventoryItemId, MovementRequest, ProcessName, SourceDocument, SourceKind, StockPosting,
};

aggregate_id_newtype!(JobWorkId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobWorkStatus {
    Sent,
    PartiallyReceived,
    Completed,
}

impl Lifecycle for JobWorkStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (JobWorkStatus::Sent, JobWorkStatus::PartiallyReceived),
        (JobWorkStatus::Sent, JobWorkStatus::Completed),
        (JobWorkStatus::PartiallyReceived, JobWorkStatus::Completed),
    ];

    fn label(self) -> &'static str {
        match self {
            JobWorkStatus::Sent => "sent",
            JobWorkStatus::PartiallyReceived => "partially_received",
            JobWorkStatus::Completed => "completed",
        }
    }
}

/// Aggregate root: JobWork.
///
/// Material goes through one or more processes in sequence. It is issued into
/// the first process's WIP and handed from each process to the next; only the
/// last process is received back through a goods receipt. Everything that
/// comes back (passed, scrap, unused) counts against the sent quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWork {
    id: JobWorkId,
    tenant_id: Option<TenantId>,
    job_number: String,
    vendor: String,
    item_id: Option<InventoryItemId>,
    processes: Vec<ProcessName>,
    /// WIP held at each process, parallel to `processes`.
    held: Vec<Quantity>,
    progress: Completion,
    passed: Quantity,
    scrap: Quantity,
    returned: Quantity,
    status: JobWorkStatus,
    version: u64,
    created: bool,
}

impl JobWork {
    pub const AGGREGATE_TYPE: &'static str = "jobwork.job";

    pub fn empty(id: JobWorkId) -> Self {
        Self {
            id,
            tenant_id: None,
            job_number: String::new(),
            vendor: String::new(),
            item_id: None,
            processes: Vec::new(),
            held: Vec::new(),
            progress: Completion::new(Quantity::ZERO),
            passed: Quantity::ZERO,
            scrap: Quantity::ZERO,
            returned: Quantity::ZERO,
            status: JobWorkStatus::Sent,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> JobWorkId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_issued(&self) -> bool {
        self.created
    }

    pub fn job_number(&self) -> &str {
        &self.job_number
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn item_id(&self) -> Option<InventoryItemId> {
        self.item_id
    }

    /// Process sequence, first to last.
    pub fn processes(&self) -> &[ProcessName] {
        &self.processes
    }

    pub fn first_process(&self) -> Option<&ProcessName> {
        self.processes.first()
    }

    /// The process goods are received back from.
    pub fn final_process(&self) -> Option<&ProcessName> {
        self.processes.last()
    }

    /// WIP currently at `process` for this job.
    pub fn held_at(&self, process: &ProcessName) -> Quantity {
        self.stage_of(process)
            .map(|stage| self.held[stage])
            .unwrap_or(Quantity::ZERO)
    }

    fn stage_of(&self, process: &ProcessName) -> Option<usize> {
        self.processes.iter().position(|p| p == process)
    }

    pub fn status(&self) -> JobWorkStatus {
        self.status
    }

    pub fn progress(&self) -> Completion {
        self.progress
    }

    pub fn passed(&self) -> Quantity {
        self.passed
    }

    pub fn scrap(&self) -> Quantity {
        self.scrap
    }

    pub fn returned(&self) -> Quantity {
        self.returned
    }

    fn status_for(progress: &Completion) -> JobWorkStatus {
        if progress.is_complete() {
            JobWorkStatus::Completed
        } else if progress.is_started() {
            JobWorkStatus::PartiallyReceived
        } else {
            JobWorkStatus::Sent
        }
    }

    fn ensure_held(&self, stage: usize, quantity: Quantity) -> DomainResult<()> {
        let held = self.held.get(stage).copied().unwrap_or(Quantity::ZERO);
        if quantity > held {
            let process = self.processes.get(stage).map(ProcessName::as_str).unwrap_or("?");
            return Err(DomainError::validation(format!(
                "only {held} of job work {} is at {process}",
                self.job_number
            )));
        }
        Ok(())
    }

    fn take_from(&mut self, stage: usize, quantity: Quantity) {
        if let Some(held) = self.held.get_mut(stage) {
            *held = held.saturating_sub(quantity);
        }
    }

    fn ensure_accepts(&self, quantity: Quantity) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant("job work is already completed"));
        }
        self.progress.ensure_accepts(quantity)?;

        let mut preview = self.progress;
        preview.record(quantity);
        let next = Self::status_for(&preview);
        if next != self.status {
            self.status.transition_to(next)?;
        }
        Ok(())
    }
}

impl AggregateRoot for JobWork {
    type Id = JobWorkId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: IssueJobWork. Sends raw material to the vendor for a sequence
/// of processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueJobWork {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub job_number: String,
    pub vendor: String,
    pub item_id: InventoryItemId,
    pub processes: Vec<ProcessName>,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdvanceJobWorkStage. Hands WIP from one process to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceJobWorkStage {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub from: ProcessName,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordJobWorkReceipt, from an inspected job-work GRN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordJobWorkReceipt {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub passed: Quantity,
    pub scrap: Quantity,
    pub grn_number: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordUnusedReturn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUnusedReturn {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobWorkCommand {
    Issue(IssueJobWork),
    AdvanceStage(AdvanceJobWorkStage),
    RecordReceipt(RecordJobWorkReceipt),
    RecordUnusedReturn(RecordUnusedReturn),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWorkIssued {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub job_number: String,
    pub vendor: String,
    pub item_id: InventoryItemId,
    pub processes: Vec<ProcessName>,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWorkStageAdvanced {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub item_id: InventoryItemId,
    pub job_number: String,
    pub from: ProcessName,
    pub to: ProcessName,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobWorkReceiptRecorded {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub passed: Quantity,
    pub scrap: Quantity,
    pub grn_number: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnusedMaterialReturned {
    pub tenant_id: TenantId,
    pub job_id: JobWorkId,
    pub item_id: InventoryItemId,
    pub process: ProcessName,
    pub job_number: String,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobWorkEvent {
    JobWorkIssued(JobWorkIssued),
    JobWorkStageAdvanced(JobWorkStageAdvanced),
    JobWorkReceiptRecorded(JobWorkReceiptRecorded),
    UnusedMaterialReturned(UnusedMaterialReturned),
}

impl JobWorkEvent {
    /// Ledger movement booked with this event.
    ///
    /// Receipts return `None`: the goods receipt note books WIP → finished/scrap.
    pub fn stock_posting(&self) -> Option<StockPosting> {
        match self {
            JobWorkEvent::JobWorkIssued(e) => Some(StockPosting::new(
                e.item_id,
                MovementRequest::MoveToWip {
                    process: e.processes.first()?.clone(),
                    quantity: e.quantity,
                },
                SourceDocument {
                    kind: SourceKind::JobWork,
                    reference: e.job_number.clone(),
                },
            )),
            JobWorkEvent::JobWorkStageAdvanced(e) => Some(StockPosting::new(
                e.item_id,
                MovementRequest::TransferWip {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    quantity: e.quantity,
                },
                SourceDocument {
                    kind: SourceKind::JobWork,
                    reference: e.job_number.clone(),
                },
            )),
            JobWorkEvent::JobWorkReceiptRecorded(_) => None,
            JobWorkEvent::UnusedMaterialReturned(e) => Some(StockPosting::new(
                e.item_id,
                MovementRequest::ReturnToRaw {
                    process: e.process.clone(),
                    quantity: e.quantity,
                },
                SourceDocument {
                    kind: SourceKind::JobWork,
                    reference: e.job_number.clone(),
                },
            )),
        }
    }
}

impl Event for JobWorkEvent {
    fn event_type(&self) -> &'static str {
        match self {
            JobWorkEvent::JobWorkIssued(_) => "jobwork.job.issued",
            JobWorkEvent::JobWorkStageAdvanced(_) => "jobwork.job.stage_advanced",
            JobWorkEvent::JobWorkReceiptRecorded(_) => "jobwork.job.receipt_recorded",
            JobWorkEvent::UnusedMaterialReturned(_) => "jobwork.job.unused_returned",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            JobWorkEvent::JobWorkIssued(e) => e.occurred_at,
            JobWorkEvent::JobWorkStageAdvanced(e) => e.occurred_at,
            JobWorkEvent::JobWorkReceiptRecorded(e) => e.occurred_at,
            JobWorkEvent::UnusedMaterialReturned(e) => e.occurred_at,
        }
    }
}

impl Aggregate for JobWork {
    type Command = JobWorkCommand;
    type Event = JobWorkEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            JobWorkEvent::JobWorkIssued(e) => {
                self.id = e.job_id;
                self.tenant_id = Some(e.tenant_id);
                self.job_number = e.job_number.clone();
                self.vendor = e.vendor.clone();
                self.item_id = Some(e.item_id);
                self.processes = e.processes.clone();
                self.held = vec![Quantity::ZERO; e.processes.len()];
                if let Some(first) = self.held.first_mut() {
                    *first = e.quantity;
                }
                self.progress = Completion::new(e.quantity);
                self.status = JobWorkStatus::Sent;
                self.created = true;
            }
            JobWorkEvent::JobWorkStageAdvanced(e) => {
                if let Some(stage) = self.stage_of(&e.from) {
                    self.take_from(stage, e.quantity);
                    if let Some(next) = self.held.get_mut(stage + 1) {
                        *next += e.quantity;
                    }
                }
            }
            JobWorkEvent::JobWorkReceiptRecorded(e) => {
                self.passed += e.passed;
                self.scrap += e.scrap;
                self.take_from(self.processes.len().saturating_sub(1), e.passed + e.scrap);
                self.progress.record(e.passed + e.scrap);
                self.status = Self::status_for(&self.progress);
            }
            JobWorkEvent::UnusedMaterialReturned(e) => {
                self.returned += e.quantity;
                self.take_from(0, e.quantity);
                self.progress.record(e.quantity);
                self.status = Self::status_for(&self.progress);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            JobWorkCommand::Issue(cmd) => self.handle_issue(cmd),
            JobWorkCommand::AdvanceStage(cmd) => self.handle_advance(cmd),
            JobWorkCommand::RecordReceipt(cmd) => self.handle_receipt(cmd),
            JobWorkCommand::RecordUnusedReturn(cmd) => self.handle_unused_return(cmd),
        }
    }
}

impl JobWork {
    fn ensure_existing(&self, tenant_id: TenantId, job_id: JobWorkId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != job_id {
            return Err(DomainError::invariant("job_id mismatch"));
        }
        Ok(())
    }

    fn handle_issue(&self, cmd: &IssueJobWork) -> DomainResult<Vec<JobWorkEvent>> {
        if self.created {
            return Err(DomainError::conflict("job work already issued"));
        }
        if cmd.job_number.trim().is_empty() {
            return Err(DomainError::validation("job number cannot be empty"));
        }
        if cmd.vendor.trim().is_empty() {
            return Err(DomainError::validation("vendor cannot be empty"));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("issued quantity must be positive"));
        }
        if cmd.processes.is_empty() {
            return Err(DomainError::validation("job work needs at least one process"));
        }
        for (idx, process) in cmd.processes.iter().enumerate() {
            if cmd.processes[..idx].contains(process) {
                return Err(DomainError::validation(format!(
                    "process {process} appears twice in the sequence"
                )));
            }
        }

        Ok(vec![JobWorkEvent::JobWorkIssued(JobWorkIssued {
            tenant_id: cmd.tenant_id,
            job_id: cmd.job_id,
            job_number: cmd.job_number.trim().to_string(),
            vendor: cmd.vendor.trim().to_string(),
            item_id: cmd.item_id,
            processes: cmd.processes.clone(),
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_advance(&self, cmd: &AdvanceJobWorkStage) -> DomainResult<Vec<JobWorkEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.job_id)?;

        if self.status.is_terminal() {
            return Err(DomainError::invariant("job work is already completed"));
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("handed-over quantity must be positive"));
        }
        let stage = self.stage_of(&cmd.from).ok_or_else(|| {
            DomainError::validation(format!(
                "process {} is not part of job work {}",
                cmd.from, self.job_number
            ))
        })?;
        let to = self.processes.get(stage + 1).cloned().ok_or_else(|| {
            DomainError::validation(format!(
                "{} is the last process; receive it through a goods receipt",
                cmd.from
            ))
        })?;
        self.ensure_held(stage, cmd.quantity)?;

        let item_id = self
            .item_id
            .ok_or_else(|| DomainError::invariant("issued job work without item"))?;

        Ok(vec![JobWorkEvent::JobWorkStageAdvanced(JobWorkStageAdvanced {
            tenant_id: cmd.tenant_id,
            job_id: cmd.job_id,
            item_id,
            job_number: self.job_number.clone(),
            from: cmd.from.clone(),
            to,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receipt(&self, cmd: &RecordJobWorkReceipt) -> DomainResult<Vec<JobWorkEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.job_id)?;

        let total = cmd.passed + cmd.scrap;
        if total.is_zero() {
            return Err(DomainError::validation("receipt quantity must be positive"));
        }
        self.ensure_accepts(total)?;
        self.ensure_held(self.processes.len().saturating_sub(1), total)?;

        Ok(vec![JobWorkEvent::JobWorkReceiptRecorded(
            JobWorkReceiptRecorded {
                tenant_id: cmd.tenant_id,
                job_id: cmd.job_id,
                passed: cmd.passed,
                scrap: cmd.scrap,
                grn_number: cmd.grn_number.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_unused_return(&self, cmd: &RecordUnusedReturn) -> DomainResult<Vec<JobWorkEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.job_id)?;

        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("returned quantity must be positive"));
        }
        self.ensure_accepts(cmd.quantity)?;
        // Only material no process has worked on yet goes back to raw.
        self.ensure_held(0, cmd.quantity)?;

        let (Some(item_id), Some(process)) = (self.item_id, self.first_process().cloned()) else {
            return Err(DomainError::invariant("issued job work without item"));
        };

        Ok(vec![JobWorkEvent::UnusedMaterialReturned(
            UnusedMaterialReturned {
                tenant_id: cmd.tenant_id,
                job_id: cmd.job_id,
                item_id,
                process,
                job_number: self.job_number.clone(),
                quantity: cmd.quantity,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
