//! Document workflows that drive the stock ledger.
//!
//! Each service decides its document command, collects the stock postings
//! the resulting events carry and commits document and ledger streams in one
//! append. A rejected movement rejects the whole step.

pub mod job_work;
pub mod production;
pub mod purchasing;
pub mod receiving;

pub use job_work::JobWorkService;
pub use production::ProductionService;
pub use purchasing::{PurchaseLine, PurchasingService};
pub use receiving::{NewGoodsReceipt, PostedReceipt, ReceivingService};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use shopfloor_core::{Aggregate, AggregateId, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};
use shopfloor_inventory::{StockLevels, StockPosting};

use crate::command_dispatcher::DispatchError;
use crate::event_store::{EventStore, StreamAppend};
use crate::ledger::StockLedger;

/// Commit a decided document append together with its stock postings.
///
/// Returns the item levels after each posting, in order.
pub(crate) async fn book<S, B>(
    ledger: &StockLedger<S, B>,
    tenant_id: TenantId,
    document: Option<StreamAppend>,
    postings: Vec<StockPosting>,
    occurred_at: DateTime<Utc>,
) -> Result<Vec<StockLevels>, DispatchError>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    let mut appends: Vec<StreamAppend> = document.into_iter().collect();
    let mut levels = Vec::with_capacity(postings.len());

    for posting in &postings {
        let planned = ledger
            .decide_posting(tenant_id, posting, None, occurred_at)
            .await?;
        levels.push(planned.levels);
        appends.extend(planned.appends);
    }

    ledger.dispatcher().commit(appends).await?;
    Ok(levels)
}

/// Rehydrate a document, mapping a never-created stream to `NotFound`.
pub(crate) async fn load_document<S, B, A>(
    ledger: &StockLedger<S, B>,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    make: impl FnOnce(TenantId, AggregateId) -> A,
    exists: impl FnOnce(&A) -> bool,
) -> Result<A, DispatchError>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    A: Aggregate,
    A::Event: serde::de::DeserializeOwned,
{
    let doc = ledger.dispatcher().load(tenant_id, aggregate_id, make).await?;
    if !exists(&doc) {
        return Err(DispatchError::NotFound);
    }
    Ok(doc)
}
