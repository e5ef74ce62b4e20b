//! Transactional stock ledger API.
//!
//! Every booking goes through `decide_*` (pure, nothing persisted) and then one
//! `commit`, so an item movement and the matching batch movement are appended
//! together. Workflow services reuse the `decide_*` half to add their own
//! document events to the same append.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use shopfloor_core::{AggregateId, AggregateRoot, Quantity, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{
    Batch, BatchCommand, BatchId, BatchNumber, ChangeQualityStatus, InventoryCommand,
    InventoryEvent, InventoryItem, InventoryItemId, MovementRequest, OpenBatch, ProcessName,
    QualityStatus, ReceiptState, RecordBatchMovement, RegisterBatch, RegisterItem,
    SetMinimumStock, SourceDocument, StockLevels, StockMovement, StockPosting, StockState,
    batch_shares, fifo_allocation,
};

use crate::command_dispatcher::{CommandDispatcher, Decided, DispatchError};
use crate::event_store::{EventStore, StreamAppend};

/// Identity of an item to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub code: String,
    pub name: String,
    pub unit_of_measure: String,
    pub minimum_stock: Option<Quantity>,
}

/// A batch to open. Without a `batch_number` the next one in the item's
/// monthly series is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBatch {
    pub batch_number: Option<BatchNumber>,
    pub origin: SourceDocument,
    pub quality: QualityStatus,
    pub expiry_date: Option<NaiveDate>,
}

/// Decided but uncommitted booking.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPosting {
    /// Item levels once the booking is committed.
    pub levels: StockLevels,
    /// Batch shares drawn by a FIFO booking; empty otherwise.
    pub allocations: Vec<(BatchId, Quantity)>,
    pub appends: Vec<StreamAppend>,
}

/// One entry of an item's movement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementRecord {
    pub sequence_number: u64,
    pub occurred_at: DateTime<Utc>,
    pub movement: StockMovement,
}

pub(crate) fn make_item(_: TenantId, id: AggregateId) -> InventoryItem {
    InventoryItem::empty(InventoryItemId::new(id))
}

pub(crate) fn make_batch(_: TenantId, id: AggregateId) -> Batch {
    Batch::empty(BatchId::new(id))
}

/// Item and batch stock operations on top of the command dispatcher.
#[derive(Debug)]
pub struct StockLedger<S, B> {
    dispatcher: Arc<CommandDispatcher<S, B>>,
}

impl<S, B> Clone for StockLedger<S, B> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

impl<S, B> StockLedger<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(dispatcher: Arc<CommandDispatcher<S, B>>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher<S, B>> {
        &self.dispatcher
    }

    pub async fn register_item(
        &self,
        tenant_id: TenantId,
        item: NewItem,
    ) -> Result<InventoryItemId, DispatchError> {
        let item_id = InventoryItemId::generate();
        let cmd = InventoryCommand::RegisterItem(RegisterItem {
            tenant_id,
            item_id,
            code: item.code,
            name: item.name,
            unit_of_measure: item.unit_of_measure,
            minimum_stock: item.minimum_stock,
            occurred_at: Utc::now(),
        });

        self.dispatcher
            .dispatch(tenant_id, item_id.aggregate_id(), InventoryItem::AGGREGATE_TYPE, cmd, make_item)
            .await?;
        debug!(%tenant_id, %item_id, "item registered");
        Ok(item_id)
    }

    pub async fn set_minimum_stock(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        minimum_stock: Option<Quantity>,
    ) -> Result<(), DispatchError> {
        let cmd = InventoryCommand::SetMinimumStock(SetMinimumStock {
            tenant_id,
            item_id,
            minimum_stock,
            occurred_at: Utc::now(),
        });
        self.dispatcher
            .dispatch(tenant_id, item_id.aggregate_id(), InventoryItem::AGGREGATE_TYPE, cmd, make_item)
            .await?;
        Ok(())
    }

    /// Registered item, rehydrated from its stream.
    pub async fn item(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<InventoryItem, DispatchError> {
        let item = self
            .dispatcher
            .load(tenant_id, item_id.aggregate_id(), make_item)
            .await?;
        if !item.is_registered() {
            return Err(DispatchError::NotFound);
        }
        Ok(item)
    }

    pub async fn batch(&self, tenant_id: TenantId, batch_id: BatchId) -> Result<Batch, DispatchError> {
        let batch = self
            .dispatcher
            .load(tenant_id, batch_id.aggregate_id(), make_batch)
            .await?;
        if !batch.is_open() {
            return Err(DispatchError::NotFound);
        }
        Ok(batch)
    }

    /// Authoritative levels, folded from the ledger.
    pub async fn stock_levels(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<StockLevels, DispatchError> {
        Ok(self.item(tenant_id, item_id).await?.levels().clone())
    }

    /// Every batch opened for an item, oldest first.
    pub async fn batches_of_item(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<Batch>, DispatchError> {
        let item = self.item(tenant_id, item_id).await?;
        self.load_batches(tenant_id, &item).await
    }

    async fn load_batches(
        &self,
        tenant_id: TenantId,
        item: &InventoryItem,
    ) -> Result<Vec<Batch>, DispatchError> {
        let mut batches = Vec::new();
        for batch_id in item.batch_ids() {
            batches.push(self.batch(tenant_id, batch_id).await?);
        }
        batches.sort_by_key(|b| (b.opened_at(), b.id_typed()));
        Ok(batches)
    }

    pub async fn movement_history(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
    ) -> Result<Vec<MovementRecord>, DispatchError> {
        let stream = self
            .dispatcher
            .store()
            .load_stream(tenant_id, item_id.aggregate_id())
            .await?;

        let mut records = Vec::new();
        for stored in stream {
            let event: InventoryEvent = serde_json::from_value(stored.payload)
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            if let InventoryEvent::StockMoved(moved) = event {
                records.push(MovementRecord {
                    sequence_number: stored.sequence_number,
                    occurred_at: moved.occurred_at,
                    movement: moved.movement,
                });
            }
        }
        Ok(records)
    }

    pub async fn next_batch_number(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        date: NaiveDate,
    ) -> Result<BatchNumber, DispatchError> {
        let item = self.item(tenant_id, item_id).await?;
        Ok(BatchNumber::next_in_series(item.code(), date, item.batch_numbers())?)
    }

    async fn decide_item(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        commands: Vec<InventoryCommand>,
    ) -> Result<Decided<InventoryItem>, DispatchError> {
        self.dispatcher
            .decide_all(tenant_id, item_id.aggregate_id(), InventoryItem::AGGREGATE_TYPE, commands, make_item)
            .await
    }

    /// Decide a booking on an item and its batches.
    ///
    /// With `batch_id` the whole booking is mirrored on that batch. Without
    /// one, the withdrawals of an item that has batches are split across them
    /// by [`batch_shares`], so the batches stay a subset of the item.
    pub async fn decide_posting(
        &self,
        tenant_id: TenantId,
        posting: &StockPosting,
        batch_id: Option<BatchId>,
        occurred_at: DateTime<Utc>,
    ) -> Result<PlannedPosting, DispatchError> {
        let decided = self
            .decide_item(
                tenant_id,
                posting.item_id,
                vec![posting.clone().into_command(tenant_id, occurred_at)],
            )
            .await?;
        let (item, events, item_append) = decided.into_parts();
        let mut appends: Vec<StreamAppend> = item_append.into_iter().collect();

        match batch_id {
            Some(batch_id) => {
                let share = self
                    .decide_batch_share(tenant_id, posting, batch_id, vec![posting.request.clone()], occurred_at)
                    .await?;
                appends.extend(share);
            }
            None if item.has_batches() && !events.is_empty() => {
                let before = self.item(tenant_id, posting.item_id).await?;
                if before.version() + events.len() as u64 != item.version() {
                    return Err(DispatchError::Concurrency(format!(
                        "item {} changed while its batches were planned",
                        posting.item_id
                    )));
                }

                let legs: Vec<StockMovement> = events
                    .into_iter()
                    .filter_map(|e| match e {
                        InventoryEvent::StockMoved(moved) => Some(moved.movement),
                        _ => None,
                    })
                    .collect();
                let batches = self.load_batches(tenant_id, &before).await?;
                let refs: Vec<&Batch> = batches.iter().collect();
                let shares = batch_shares(&refs, before.levels(), &legs, occurred_at.date_naive())?;

                for (batch_id, requests) in shares {
                    debug!(%tenant_id, %batch_id, legs = requests.len(), "booking batch share");
                    let share = self
                        .decide_batch_share(tenant_id, posting, batch_id, requests, occurred_at)
                        .await?;
                    appends.extend(share);
                }
            }
            None => {}
        }

        Ok(PlannedPosting {
            levels: item.levels().clone(),
            allocations: vec![],
            appends,
        })
    }

    /// Decide an issue or dispatch drawn from the item's batches oldest first.
    ///
    /// Only good, unexpired batches are drawn. Fails with `InsufficientStock`
    /// when they hold less than the requested quantity.
    pub async fn decide_fifo_posting(
        &self,
        tenant_id: TenantId,
        posting: &StockPosting,
        occurred_at: DateTime<Utc>,
    ) -> Result<PlannedPosting, DispatchError> {
        let (state, quantity) = match &posting.request {
            MovementRequest::MoveToWip { quantity, .. } => (StockState::Raw, *quantity),
            MovementRequest::Dispatch { quantity } => (StockState::Finished, *quantity),
            other => {
                return Err(DispatchError::Validation(format!(
                    "{} cannot be allocated across batches",
                    other.operation()
                )));
            }
        };

        let batches = self.batches_of_item(tenant_id, posting.item_id).await?;
        let refs: Vec<&Batch> = batches.iter().collect();
        let allocations = fifo_allocation(&refs, &state, quantity, occurred_at.date_naive())?;

        let decided = self
            .decide_item(
                tenant_id,
                posting.item_id,
                vec![posting.clone().into_command(tenant_id, occurred_at)],
            )
            .await?;
        let (item, _, item_append) = decided.into_parts();
        let mut appends: Vec<StreamAppend> = item_append.into_iter().collect();

        for (batch_id, share) in &allocations {
            let request = match &posting.request {
                MovementRequest::MoveToWip { process, .. } => MovementRequest::MoveToWip {
                    process: process.clone(),
                    quantity: *share,
                },
                _ => MovementRequest::Dispatch { quantity: *share },
            };
            let append = self
                .decide_batch_share(tenant_id, posting, *batch_id, vec![request], occurred_at)
                .await?;
            appends.extend(append);
        }

        Ok(PlannedPosting {
            levels: item.levels().clone(),
            allocations,
            appends,
        })
    }

    async fn decide_batch_share(
        &self,
        tenant_id: TenantId,
        posting: &StockPosting,
        batch_id: BatchId,
        requests: Vec<MovementRequest>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Option<StreamAppend>, DispatchError> {
        let commands = requests
            .into_iter()
            .map(|request| {
                BatchCommand::RecordMovement(RecordBatchMovement {
                    tenant_id,
                    batch_id,
                    request,
                    source: posting.source.clone(),
                    occurred_at,
                })
            })
            .collect();
        let decided = self
            .dispatcher
            .decide_all(tenant_id, batch_id.aggregate_id(), Batch::AGGREGATE_TYPE, commands, make_batch)
            .await?;

        if decided.aggregate().item_id() != Some(posting.item_id) {
            return Err(DispatchError::Validation(format!(
                "batch {batch_id} does not belong to item {}",
                posting.item_id
            )));
        }
        Ok(decided.into_parts().2)
    }

    /// Decide opening a batch, optionally with its first booking.
    ///
    /// The batch number is claimed on the item stream in the same append, so
    /// two openings racing for one number cannot both commit. The initial
    /// booking lands on the item and wholly on the new batch.
    pub async fn decide_new_batch(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        batch: NewBatch,
        initial: Option<&StockPosting>,
        occurred_at: DateTime<Utc>,
    ) -> Result<(BatchId, PlannedPosting), DispatchError> {
        let batch_number = match batch.batch_number {
            Some(number) => number,
            None => {
                self.next_batch_number(tenant_id, item_id, occurred_at.date_naive())
                    .await?
            }
        };

        let batch_id = BatchId::generate();
        let mut item_commands = vec![InventoryCommand::RegisterBatch(RegisterBatch {
            tenant_id,
            item_id,
            batch_id,
            batch_number: batch_number.clone(),
            occurred_at,
        })];
        let mut batch_commands = vec![BatchCommand::OpenBatch(OpenBatch {
            tenant_id,
            batch_id,
            item_id,
            batch_number,
            origin: batch.origin,
            quality: batch.quality,
            expiry_date: batch.expiry_date,
            occurred_at,
        })];
        if let Some(posting) = initial {
            if posting.item_id != item_id {
                return Err(DispatchError::Validation(format!(
                    "initial booking is for item {}, not {item_id}",
                    posting.item_id
                )));
            }
            item_commands.push(posting.clone().into_command(tenant_id, occurred_at));
            batch_commands.push(BatchCommand::RecordMovement(RecordBatchMovement {
                tenant_id,
                batch_id,
                request: posting.request.clone(),
                source: posting.source.clone(),
                occurred_at,
            }));
        }

        let (item, _, item_append) = self
            .decide_item(tenant_id, item_id, item_commands)
            .await?
            .into_parts();
        let decided = self
            .dispatcher
            .decide_all(tenant_id, batch_id.aggregate_id(), Batch::AGGREGATE_TYPE, batch_commands, make_batch)
            .await?;

        let appends = item_append.into_iter().chain(decided.into_parts().2).collect();
        Ok((
            batch_id,
            PlannedPosting {
                levels: item.levels().clone(),
                allocations: vec![],
                appends,
            },
        ))
    }

    pub async fn open_batch(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        batch: NewBatch,
    ) -> Result<BatchId, DispatchError> {
        let (batch_id, planned) = self
            .decide_new_batch(tenant_id, item_id, batch, None, Utc::now())
            .await?;
        self.dispatcher.commit(planned.appends).await?;
        debug!(%tenant_id, %item_id, %batch_id, "batch opened");
        Ok(batch_id)
    }

    pub async fn change_batch_quality(
        &self,
        tenant_id: TenantId,
        batch_id: BatchId,
        quality: QualityStatus,
    ) -> Result<(), DispatchError> {
        let cmd = BatchCommand::ChangeQualityStatus(ChangeQualityStatus {
            tenant_id,
            batch_id,
            quality,
            occurred_at: Utc::now(),
        });
        self.dispatcher
            .dispatch(tenant_id, batch_id.aggregate_id(), Batch::AGGREGATE_TYPE, cmd, make_batch)
            .await?;
        Ok(())
    }

    /// Book a movement and return the item's levels afterwards.
    #[instrument(
        skip(self, posting),
        fields(
            tenant_id = %tenant_id,
            item_id = %posting.item_id,
            operation = posting.request.operation(),
            source = %posting.source
        ),
        err
    )]
    pub async fn post(
        &self,
        tenant_id: TenantId,
        posting: StockPosting,
        batch_id: Option<BatchId>,
    ) -> Result<StockLevels, DispatchError> {
        let planned = self
            .decide_posting(tenant_id, &posting, batch_id, Utc::now())
            .await?;
        self.dispatcher.commit(planned.appends).await?;
        Ok(planned.levels)
    }

    /// FIFO variant of [`Self::post`]; returns levels and the batch shares drawn.
    pub async fn post_fifo(
        &self,
        tenant_id: TenantId,
        posting: StockPosting,
    ) -> Result<(StockLevels, Vec<(BatchId, Quantity)>), DispatchError> {
        let planned = self.decide_fifo_posting(tenant_id, &posting, Utc::now()).await?;
        self.dispatcher.commit(planned.appends).await?;
        Ok((planned.levels, planned.allocations))
    }

    pub async fn move_to_wip(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        process: ProcessName,
        quantity: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::MoveToWip { process, quantity };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }

    pub async fn receive_from_wip(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        process: ProcessName,
        passed: Quantity,
        scrap: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::ReceiveFromWip {
            process,
            passed,
            scrap,
        };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }

    pub async fn receive_external(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        state: ReceiptState,
        quantity: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::ReceiveExternal { state, quantity };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }

    pub async fn return_to_raw(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        process: ProcessName,
        quantity: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::ReturnToRaw { process, quantity };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }

    pub async fn consume_wip(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        process: ProcessName,
        quantity: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::ConsumeWip { process, quantity };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }

    pub async fn dispatch(
        &self,
        tenant_id: TenantId,
        item_id: InventoryItemId,
        quantity: Quantity,
        source: SourceDocument,
    ) -> Result<StockLevels, DispatchError> {
        let request = MovementRequest::Dispatch { quantity };
        self.post(tenant_id, StockPosting::new(item_id, request, source), None)
            .await
    }
}
