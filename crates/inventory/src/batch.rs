//! Batch (lot) overlay.
//!
//! A batch subdivides one item's stock so material can be traced back to the
//! document it arrived with. Batch movements are always booked together with
//! the same movement on the owning item, so the item totals stay the sum of
//! what its batches (plus any un-batched stock) hold.

use core::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, Lifecycle, Quantity, TenantId,
    aggregate_id_newtype,
};
use shopfloor_events::Event;

use crate::item::InventoryItemId;
use crate::levels::StockLevels;
use crate::movement::{MovementRequest, SourceDocument, StockMovement};
use crate::state::StockState;

aggregate_id_newtype!(
    /// Batch stream identifier.
    BatchId
);

/// Lot number in the `{PREFIX}-{yymm}-{seq:03}` series, e.g. `MSS-2410-007`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchNumber(String);

impl BatchNumber {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(DomainError::validation("batch number cannot be empty"));
        }
        Ok(Self(value))
    }

    /// Series prefix for an item on a date: first three alphanumeric
    /// characters of the item code, uppercased, then `yymm`.
    pub fn series(item_code: &str, date: NaiveDate) -> DomainResult<String> {
        let prefix: String = item_code
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .take(3)
            .collect::<String>()
            .to_uppercase();
        if prefix.is_empty() {
            return Err(DomainError::validation(
                "item code has no characters usable as a batch prefix",
            ));
        }
        Ok(format!("{prefix}-{}", date.format("%y%m")))
    }

    /// Next number in the series, one past the highest sequence already used.
    pub fn next_in_series<'a>(
        item_code: &str,
        date: NaiveDate,
        existing: impl IntoIterator<Item = &'a BatchNumber>,
    ) -> DomainResult<Self> {
        let series = Self::series(item_code, date)?;
        let last = existing
            .into_iter()
            .filter_map(|b| b.sequence_in(&series))
            .max()
            .unwrap_or(0);
        Ok(Self(format!("{series}-{:03}", last + 1)))
    }

    fn sequence_in(&self, series: &str) -> Option<u32> {
        self.0
            .strip_prefix(series)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quality gate of a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    PendingInspection,
    Good,
    Defective,
}

impl Lifecycle for QualityStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (QualityStatus::PendingInspection, QualityStatus::Good),
        (QualityStatus::PendingInspection, QualityStatus::Defective),
        (QualityStatus::Good, QualityStatus::Defective),
    ];

    fn label(self) -> &'static str {
        match self {
            QualityStatus::PendingInspection => "pending_inspection",
            QualityStatus::Good => "good",
            QualityStatus::Defective => "defective",
        }
    }
}

/// Aggregate root: Batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    tenant_id: Option<TenantId>,
    item_id: Option<InventoryItemId>,
    batch_number: Option<BatchNumber>,
    origin: Option<SourceDocument>,
    quality: QualityStatus,
    expiry_date: Option<NaiveDate>,
    opened_at: Option<DateTime<Utc>>,
    levels: StockLevels,
    version: u64,
    created: bool,
}

impl Batch {
    pub const AGGREGATE_TYPE: &'static str = "inventory.batch";

    pub fn empty(id: BatchId) -> Self {
        Self {
            id,
            tenant_id: None,
            item_id: None,
            batch_number: None,
            origin: None,
            quality: QualityStatus::PendingInspection,
            expiry_date: None,
            opened_at: None,
            levels: StockLevels::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> BatchId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_open(&self) -> bool {
        self.created
    }

    pub fn item_id(&self) -> Option<InventoryItemId> {
        self.item_id
    }

    pub fn batch_number(&self) -> Option<&BatchNumber> {
        self.batch_number.as_ref()
    }

    /// Document the batch was created from.
    pub fn origin(&self) -> Option<&SourceDocument> {
        self.origin.as_ref()
    }

    pub fn quality(&self) -> QualityStatus {
        self.quality
    }

    pub fn expiry_date(&self) -> Option<NaiveDate> {
        self.expiry_date
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn levels(&self) -> &StockLevels {
        &self.levels
    }

    pub fn is_expired_on(&self, date: NaiveDate) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry < date)
    }

    /// Issue/dispatch gate: good quality and not expired on `date`.
    pub fn ensure_issuable(&self, date: NaiveDate) -> DomainResult<()> {
        let number = self.batch_number.as_ref().map(|b| b.as_str()).unwrap_or("?");
        if self.quality != QualityStatus::Good {
            return Err(DomainError::validation(format!(
                "batch {number} is {} and cannot be issued",
                self.quality.label()
            )));
        }
        if self.is_expired_on(date) {
            return Err(DomainError::validation(format!("batch {number} has expired")));
        }
        Ok(())
    }
}

impl AggregateRoot for Batch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenBatch {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub item_id: InventoryItemId,
    pub batch_number: BatchNumber,
    pub origin: SourceDocument,
    pub quality: QualityStatus,
    pub expiry_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordBatchMovement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatchMovement {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub request: MovementRequest,
    pub source: SourceDocument,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeQualityStatus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeQualityStatus {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub quality: QualityStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchCommand {
    OpenBatch(OpenBatch),
    RecordMovement(RecordBatchMovement),
    ChangeQualityStatus(ChangeQualityStatus),
}

/// Event: BatchOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOpened {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub item_id: InventoryItemId,
    pub batch_number: BatchNumber,
    pub origin: SourceDocument,
    pub quality: QualityStatus,
    pub expiry_date: Option<NaiveDate>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchStockMoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStockMoved {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub item_id: InventoryItemId,
    pub movement: StockMovement,
    pub occurred_at: DateTime<Utc>,
}

/// Event: QualityStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityStatusChanged {
    pub tenant_id: TenantId,
    pub batch_id: BatchId,
    pub from: QualityStatus,
    pub to: QualityStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchEvent {
    BatchOpened(BatchOpened),
    StockMoved(BatchStockMoved),
    QualityStatusChanged(QualityStatusChanged),
}

impl Event for BatchEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::BatchOpened(_) => "inventory.batch.opened",
            BatchEvent::StockMoved(_) => "inventory.batch.stock_moved",
            BatchEvent::QualityStatusChanged(_) => "inventory.batch.quality_status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BatchEvent::BatchOpened(e) => e.occurred_at,
            BatchEvent::StockMoved(e) => e.occurred_at,
            BatchEvent::QualityStatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Batch {
    type Command = BatchCommand;
    type Event = BatchEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BatchEvent::BatchOpened(e) => {
                self.id = e.batch_id;
                self.tenant_id = Some(e.tenant_id);
                self.item_id = Some(e.item_id);
                self.batch_number = Some(e.batch_number.clone());
                self.origin = Some(e.origin.clone());
                self.quality = e.quality;
                self.expiry_date = e.expiry_date;
                self.opened_at = Some(e.occurred_at);
                self.levels = StockLevels::new();
                self.created = true;
            }
            BatchEvent::StockMoved(e) => {
                self.levels.apply(&e.movement);
            }
            BatchEvent::QualityStatusChanged(e) => {
                self.quality = e.to;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            BatchCommand::OpenBatch(cmd) => self.handle_open(cmd),
            BatchCommand::RecordMovement(cmd) => self.handle_movement(cmd),
            BatchCommand::ChangeQualityStatus(cmd) => self.handle_quality(cmd),
        }
    }
}

impl Batch {
    fn ensure_existing(&self, tenant_id: TenantId, batch_id: BatchId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != batch_id {
            return Err(DomainError::invariant("batch_id mismatch"));
        }
        Ok(())
    }

    fn handle_open(&self, cmd: &OpenBatch) -> DomainResult<Vec<BatchEvent>> {
        if self.created {
            return Err(DomainError::conflict("batch already exists"));
        }
        if cmd.quality == QualityStatus::Defective {
            return Err(DomainError::validation("a batch cannot be opened as defective"));
        }

        Ok(vec![BatchEvent::BatchOpened(BatchOpened {
            tenant_id: cmd.tenant_id,
            batch_id: cmd.batch_id,
            item_id: cmd.item_id,
            batch_number: cmd.batch_number.clone(),
            origin: cmd.origin.clone(),
            quality: cmd.quality,
            expiry_date: cmd.expiry_date,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_movement(&self, cmd: &RecordBatchMovement) -> DomainResult<Vec<BatchEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.batch_id)?;

        if matches!(
            cmd.request,
            MovementRequest::MoveToWip { .. } | MovementRequest::Dispatch { .. }
        ) {
            self.ensure_issuable(cmd.occurred_at.date_naive())?;
        }

        let item_id = self
            .item_id
            .ok_or_else(|| DomainError::invariant("open batch has no item"))?;
        let legs = self.levels.plan(&cmd.request, &cmd.source)?;
        Ok(legs
            .into_iter()
            .map(|movement| {
                BatchEvent::StockMoved(BatchStockMoved {
                    tenant_id: cmd.tenant_id,
                    batch_id: cmd.batch_id,
                    item_id,
                    movement,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect())
    }

    fn handle_quality(&self, cmd: &ChangeQualityStatus) -> DomainResult<Vec<BatchEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.batch_id)?;
        if self.quality == cmd.quality {
            return Ok(vec![]);
        }
        let to = self.quality.transition_to(cmd.quality)?;
        Ok(vec![BatchEvent::QualityStatusChanged(QualityStatusChanged {
            tenant_id: cmd.tenant_id,
            batch_id: cmd.batch_id,
            from: self.quality,
            to,
            occurred_at: cmd.occurred_at,
        })])
    }
}

/// First-in-first-out allocation of `required` from `state` across batches.
///
/// Batches are taken oldest first; batches that are not good quality or are
/// expired on `date` are skipped. Fails with `InsufficientStock` when the
/// eligible batches together hold less than `required`.
pub fn fifo_allocation(
    batches: &[&Batch],
    state: &StockState,
    required: Quantity,
    date: NaiveDate,
) -> DomainResult<Vec<(BatchId, Quantity)>> {
    let mut eligible: Vec<&&Batch> = batches
        .iter()
        .filter(|b| b.ensure_issuable(date).is_ok() && !b.levels.get(state).is_zero())
        .collect();
    eligible.sort_by_key(|b| (b.opened_at, b.id));

    let mut remaining = required;
    let mut plan = Vec::new();
    for batch in eligible {
        if remaining.is_zero() {
            break;
        }
        let held = batch.levels.get(state);
        let take = held.min(remaining);
        plan.push((batch.id, take));
        remaining = remaining.saturating_sub(take);
    }

    if !remaining.is_zero() {
        let available: Quantity = plan.iter().map(|(_, q)| *q).sum();
        return Err(DomainError::insufficient_stock(
            format!("batches:{state}"),
            available.value(),
            required.value(),
        ));
    }

    Ok(plan)
}

/// Split an item booking across the item's batches.
///
/// Each withdrawal leg draws from batches oldest first and then from the part
/// of the source bucket no batch holds. Raw and finished stock is only drawn
/// from batches that pass the issue gate on `date`; WIP is drawn wherever it
/// sits. Receipt legs stay un-batched. Fails with `InsufficientStock` when
/// eligible batches and un-batched stock together cannot cover a leg.
pub fn batch_shares(
    batches: &[&Batch],
    item: &StockLevels,
    legs: &[StockMovement],
    date: NaiveDate,
) -> DomainResult<Vec<(BatchId, Vec<MovementRequest>)>> {
    let mut ordered: Vec<&Batch> = batches.to_vec();
    ordered.sort_by_key(|b| (b.opened_at, b.id));

    let mut item_levels = item.clone();
    let mut batch_levels: Vec<StockLevels> = ordered.iter().map(|b| b.levels.clone()).collect();
    let mut shares: Vec<Vec<MovementRequest>> = vec![Vec::new(); ordered.len()];

    for leg in legs {
        let Some(from) = &leg.from else {
            item_levels.apply(leg);
            continue;
        };

        let held: Quantity = batch_levels.iter().map(|l| l.get(from)).sum();
        let unbatched = item_levels.get(from).saturating_sub(held);
        let gated = matches!(from, StockState::Raw | StockState::Finished);

        let mut remaining = leg.quantity;
        for (i, batch) in ordered.iter().enumerate() {
            if remaining.is_zero() {
                break;
            }
            if gated && batch.ensure_issuable(date).is_err() {
                continue;
            }
            let take = batch_levels[i].get(from).min(remaining);
            if take.is_zero() {
                continue;
            }
            let share = StockMovement {
                quantity: take,
                ..leg.clone()
            };
            let request = MovementRequest::for_leg(&share).ok_or_else(|| {
                DomainError::invariant(format!("no batch request books {from} out"))
            })?;
            batch_levels[i].apply(&share);
            shares[i].push(request);
            remaining = remaining.saturating_sub(take);
        }

        if remaining > unbatched {
            let drawn = leg.quantity.saturating_sub(remaining);
            return Err(DomainError::insufficient_stock(
                format!("issuable {from}"),
                (drawn + unbatched).value(),
                leg.quantity.value(),
            ));
        }
        item_levels.apply(leg);
    }

    Ok(ordered
        .iter()
        .zip(shares)
        .filter(|(_, requests)| !requests.is_empty())
        .map(|(batch, requests)| (batch.id, requests))
        .collect())
}
