//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (tenant-scoped)
//!   ↓
//! 2. Rehydrate aggregate
//!   ↓
//! 3. Handle command (pure decision, produces events)          ── decide
//!   ↓
//! 4. Persist events (atomic, optimistic concurrency per stream) ── commit
//!   ↓
//! 5. Publish committed events to the bus
//! ```
//!
//! `dispatch` runs the whole pipeline for one aggregate. Workflows that touch
//! several aggregates call `decide` once per aggregate and hand every resulting
//! [`StreamAppend`] to a single `commit`, so a purchase receipt and the stock
//! movement it causes land together or not at all.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use shopfloor_core::{Aggregate, AggregateId, Decimal, DomainError, ExpectedVersion, TenantId};
use shopfloor_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale stream version) or duplicate create.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// A movement would drive a stock bucket negative.
    #[error("insufficient {state} stock: available {available}, requested {requested}")]
    InsufficientStock {
        state: String,
        available: Decimal,
        requested: Decimal,
    },
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error("not found")]
    NotFound,
    /// Historical payload no longer matches the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    #[error(transparent)]
    Store(EventStoreError),
    /// Publication failed after a successful append. Events are durable.
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    /// Deterministic rejection of the command itself; retrying cannot help.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DispatchError::Validation(_)
                | DispatchError::InvariantViolation(_)
                | DispatchError::InsufficientStock { .. }
                | DispatchError::InvalidTransition { .. }
                | DispatchError::NotFound
        )
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InsufficientStock {
                state,
                available,
                requested,
            } => DispatchError::InsufficientStock {
                state,
                available,
                requested,
            },
            DomainError::InvalidTransition { from, to } => {
                DispatchError::InvalidTransition { from, to }
            }
        }
    }
}

/// Outcome of `decide`: the aggregate with the new events folded in, the typed
/// events, and the uncommitted append (absent when nothing was decided).
#[derive(Debug)]
pub struct Decided<A: Aggregate> {
    aggregate: A,
    events: Vec<A::Event>,
    append: Option<StreamAppend>,
}

impl<A: Aggregate> Decided<A> {
    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    pub fn events(&self) -> &[A::Event] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_parts(self) -> (A, Vec<A::Event>, Option<StreamAppend>) {
        (self.aggregate, self.events, self.append)
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run against
/// `InMemoryEventStore` / `InMemoryEventBus` and production against Postgres.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Rehydrate an aggregate from its stream.
    pub async fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id).await?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Decide one command without persisting anything.
    pub async fn decide<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Decided<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: shopfloor_events::Event + Serialize + DeserializeOwned,
    {
        self.decide_all(tenant_id, aggregate_id, aggregate_type, vec![command], make_aggregate)
            .await
    }

    /// Decide several commands against one aggregate in order, each seeing the
    /// events of the previous ones. Fails as a whole if any command fails.
    pub async fn decide_all<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        commands: Vec<A::Command>,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Decided<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: shopfloor_events::Event + Serialize + DeserializeOwned,
    {
        let history = self.store.load_stream(tenant_id, aggregate_id).await?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        let mut events = Vec::new();
        for command in &commands {
            let decided = aggregate.handle(command).map_err(DispatchError::from)?;
            for ev in &decided {
                aggregate.apply(ev);
            }
            events.extend(decided);
        }

        let uncommitted = events
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    Uuid::now_v7(),
                    ev,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Decided {
            aggregate,
            events,
            append: StreamAppend::from_events(uncommitted, expected),
        })
    }

    /// Persist decided streams in one atomic append, then publish.
    pub async fn commit(
        &self,
        appends: impl IntoIterator<Item = StreamAppend>,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let batch: Vec<StreamAppend> = appends.into_iter().collect();
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let committed = self.store.append_all(batch).await?;

        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        Ok(committed)
    }

    /// Decide and commit a single command.
    pub async fn dispatch<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(TenantId, AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: shopfloor_events::Event + Serialize + DeserializeOwned,
    {
        let decided = self
            .decide(tenant_id, aggregate_id, aggregate_type, command, make_aggregate)
            .await?;
        let (_, _, append) = decided.into_parts();
        self.commit(append).await
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

pub(crate) fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
