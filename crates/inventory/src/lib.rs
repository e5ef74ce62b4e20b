//! Multi-state inventory ledger (event-sourced).
//!
//! Each item holds stock in four states: raw, WIP per manufacturing process,
//! finished and scrap. Quantities change only through movement operations,
//! and every movement is recorded as a `StockMoved` event. Batches (lots)
//! subdivide an item's stock for traceability and follow the same rules.
//!
//! Pure domain logic: no IO, no storage.

pub mod batch;
pub mod item;
pub mod levels;
pub mod movement;
pub mod state;

pub use batch::{
    Batch, BatchCommand, BatchEvent, BatchId, BatchNumber, BatchOpened, BatchStockMoved,
    ChangeQualityStatus, OpenBatch, QualityStatus, QualityStatusChanged, RecordBatchMovement,
    batch_shares, fifo_allocation,
};
pub use item::{
    BatchRegistered, InventoryCommand, InventoryEvent, InventoryItem, InventoryItemId,
    ItemRegistered, MinimumStockChanged, RecordMovement, RegisterBatch, RegisterItem,
    SetMinimumStock, StockMoved, StockPosting,
};
pub use levels::StockLevels;
pub use movement::{MovementRequest, SourceDocument, SourceKind, StockMovement};
pub use state::{ProcessName, ReceiptState, StockState};
