use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, DomainError, DomainResult, Quantity, TenantId, aggregate_id_newtype,
};
use shopfloor_events::Event;

use crate::batch::{BatchId, BatchNumber};
use crate::levels::StockLevels;
use crate::movement::{MovementRequest, SourceDocument, StockMovement};

aggregate_id_newtype!(
    /// Inventory item stream identifier.
    InventoryItemId
);

/// Aggregate root: an item and its stock in every state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    id: InventoryItemId,
    tenant_id: Option<TenantId>,
    code: String,
    name: String,
    unit_of_measure: String,
    minimum_stock: Option<Quantity>,
    levels: StockLevels,
    batches: Vec<(BatchId, BatchNumber)>,
    version: u64,
    created: bool,
}

impl InventoryItem {
    pub const AGGREGATE_TYPE: &'static str = "inventory.item";

    /// Not-yet-registered instance for rehydration.
    pub fn empty(id: InventoryItemId) -> Self {
        Self {
            id,
            tenant_id: None,
            code: String::new(),
            name: String::new(),
            unit_of_measure: String::new(),
            minimum_stock: None,
            levels: StockLevels::new(),
            batches: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryItemId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_registered(&self) -> bool {
        self.created
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_of_measure(&self) -> &str {
        &self.unit_of_measure
    }

    /// Reorder level; `None` disables low-stock alerts.
    pub fn minimum_stock(&self) -> Option<Quantity> {
        self.minimum_stock
    }

    pub fn levels(&self) -> &StockLevels {
        &self.levels
    }

    pub fn total_stock(&self) -> Quantity {
        self.levels.total_stock()
    }

    /// Batches registered against this item, in opening order.
    pub fn batch_ids(&self) -> impl Iterator<Item = BatchId> + '_ {
        self.batches.iter().map(|(id, _)| *id)
    }

    pub fn batch_numbers(&self) -> impl Iterator<Item = &BatchNumber> {
        self.batches.iter().map(|(_, number)| number)
    }

    pub fn has_batches(&self) -> bool {
        !self.batches.is_empty()
    }
}

impl AggregateRoot for InventoryItem {
    type Id = InventoryItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterItem {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub code: String,
    pub name: String,
    pub unit_of_measure: String,
    pub minimum_stock: Option<Quantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetMinimumStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMinimumStock {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub minimum_stock: Option<Quantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordMovement (any movement operation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMovement {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub request: MovementRequest,
    pub source: SourceDocument,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RegisterBatch. Claims a batch number for the item; the batch
/// stream is opened in the same append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBatch {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub batch_id: BatchId,
    pub batch_number: BatchNumber,
    pub occurred_at: DateTime<Utc>,
}

/// Movement a workflow step books against an item; converted into a
/// [`RecordMovement`] by the ledger service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPosting {
    pub item_id: InventoryItemId,
    pub request: MovementRequest,
    pub source: SourceDocument,
}

impl StockPosting {
    pub fn new(item_id: InventoryItemId, request: MovementRequest, source: SourceDocument) -> Self {
        Self {
            item_id,
            request,
            source,
        }
    }

    pub fn into_command(self, tenant_id: TenantId, occurred_at: DateTime<Utc>) -> InventoryCommand {
        InventoryCommand::RecordMovement(RecordMovement {
            tenant_id,
            item_id: self.item_id,
            request: self.request,
            source: self.source,
            occurred_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    RegisterItem(RegisterItem),
    SetMinimumStock(SetMinimumStock),
    RecordMovement(RecordMovement),
    RegisterBatch(RegisterBatch),
}

/// Event: ItemRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRegistered {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub code: String,
    pub name: String,
    pub unit_of_measure: String,
    pub minimum_stock: Option<Quantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MinimumStockChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumStockChanged {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub minimum_stock: Option<Quantity>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockMoved. One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMoved {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub movement: StockMovement,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRegistered {
    pub tenant_id: TenantId,
    pub item_id: InventoryItemId,
    pub batch_id: BatchId,
    pub batch_number: BatchNumber,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    ItemRegistered(ItemRegistered),
    MinimumStockChanged(MinimumStockChanged),
    StockMoved(StockMoved),
    BatchRegistered(BatchRegistered),
}

impl InventoryEvent {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            InventoryEvent::ItemRegistered(e) => e.tenant_id,
            InventoryEvent::MinimumStockChanged(e) => e.tenant_id,
            InventoryEvent::StockMoved(e) => e.tenant_id,
            InventoryEvent::BatchRegistered(e) => e.tenant_id,
        }
    }

    pub fn item_id(&self) -> InventoryItemId {
        match self {
            InventoryEvent::ItemRegistered(e) => e.item_id,
            InventoryEvent::MinimumStockChanged(e) => e.item_id,
            InventoryEvent::StockMoved(e) => e.item_id,
            InventoryEvent::BatchRegistered(e) => e.item_id,
        }
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::ItemRegistered(_) => "inventory.item.registered",
            InventoryEvent::MinimumStockChanged(_) => "inventory.item.minimum_stock_changed",
            InventoryEvent::StockMoved(_) => "inventory.item.stock_moved",
            InventoryEvent::BatchRegistered(_) => "inventory.item.batch_registered",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::ItemRegistered(e) => e.occurred_at,
            InventoryEvent::MinimumStockChanged(e) => e.occurred_at,
            InventoryEvent::StockMoved(e) => e.occurred_at,
            InventoryEvent::BatchRegistered(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryItem {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::ItemRegistered(e) => {
                self.id = e.item_id;
                self.tenant_id = Some(e.tenant_id);
                self.code = e.code.clone();
                self.name = e.name.clone();
                self.unit_of_measure = e.unit_of_measure.clone();
                self.minimum_stock = e.minimum_stock;
                self.levels = StockLevels::new();
                self.batches.clear();
                self.created = true;
            }
            InventoryEvent::MinimumStockChanged(e) => {
                self.minimum_stock = e.minimum_stock;
            }
            InventoryEvent::StockMoved(e) => {
                self.levels.apply(&e.movement);
            }
            InventoryEvent::BatchRegistered(e) => {
                self.batches.push((e.batch_id, e.batch_number.clone()));
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::RegisterItem(cmd) => self.handle_register(cmd),
            InventoryCommand::SetMinimumStock(cmd) => self.handle_minimum_stock(cmd),
            InventoryCommand::RecordMovement(cmd) => self.handle_movement(cmd),
            InventoryCommand::RegisterBatch(cmd) => self.handle_register_batch(cmd),
        }
    }
}

impl InventoryItem {
    fn ensure_tenant(&self, tenant_id: TenantId) -> DomainResult<()> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_item_id(&self, item_id: InventoryItemId) -> DomainResult<()> {
        if self.id != item_id {
            return Err(DomainError::invariant("item_id mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(&self, tenant_id: TenantId, item_id: InventoryItemId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(tenant_id)?;
        self.ensure_item_id(item_id)
    }

    fn handle_register(&self, cmd: &RegisterItem) -> DomainResult<Vec<InventoryEvent>> {
        if self.created {
            return Err(DomainError::conflict("item already exists"));
        }
        let code = cmd.code.trim();
        if code.is_empty() {
            return Err(DomainError::validation("item code cannot be empty"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if cmd.unit_of_measure.trim().is_empty() {
            return Err(DomainError::validation("unit of measure cannot be empty"));
        }

        Ok(vec![InventoryEvent::ItemRegistered(ItemRegistered {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            code: code.to_string(),
            name: cmd.name.trim().to_string(),
            unit_of_measure: cmd.unit_of_measure.trim().to_string(),
            minimum_stock: cmd.minimum_stock,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_minimum_stock(&self, cmd: &SetMinimumStock) -> DomainResult<Vec<InventoryEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.item_id)?;
        if self.minimum_stock == cmd.minimum_stock {
            return Ok(vec![]);
        }
        Ok(vec![InventoryEvent::MinimumStockChanged(MinimumStockChanged {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            minimum_stock: cmd.minimum_stock,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_register_batch(&self, cmd: &RegisterBatch) -> DomainResult<Vec<InventoryEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.item_id)?;
        if self.batch_ids().any(|id| id == cmd.batch_id) {
            return Err(DomainError::conflict("batch already registered"));
        }
        if self.batch_numbers().any(|n| n == &cmd.batch_number) {
            return Err(DomainError::validation(format!(
                "batch number {} already used for this item",
                cmd.batch_number
            )));
        }

        Ok(vec![InventoryEvent::BatchRegistered(BatchRegistered {
            tenant_id: cmd.tenant_id,
            item_id: cmd.item_id,
            batch_id: cmd.batch_id,
            batch_number: cmd.batch_number.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_movement(&self, cmd: &RecordMovement) -> DomainResult<Vec<InventoryEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.item_id)?;

        let legs = self.levels.plan(&cmd.request, &cmd.source)?;
        Ok(legs
            .into_iter()
            .map(|movement| {
                InventoryEvent::StockMoved(StockMoved {
                    tenant_id: cmd.tenant_id,
                    item_id: cmd.item_id,
                    movement,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect())
    }
}
