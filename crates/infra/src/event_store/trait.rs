use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use shopfloor_core::{AggregateId, ExpectedVersion, TenantId};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Built from a typed domain event with [`UncommittedEvent::from_typed`], which
/// serializes the payload and captures the metadata needed to deserialize it
/// again on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream.
///
/// Sequence numbers are per stream `(tenant_id, aggregate_id)`, start at 1 and
/// never have gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Convert a stored event into a tenant-scoped envelope for publication.
    pub fn to_envelope(&self) -> shopfloor_events::EventEnvelope<JsonValue> {
        shopfloor_events::EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Events for one stream inside a multi-stream append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAppend {
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub expected_version: ExpectedVersion,
    pub events: Vec<UncommittedEvent>,
}

impl StreamAppend {
    /// Stream header taken from the first event. `None` for an empty batch.
    pub fn from_events(
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Option<Self> {
        let first = events.first()?;
        Some(Self {
            tenant_id: first.tenant_id,
            aggregate_id: first.aggregate_id,
            aggregate_type: first.aggregate_type.clone(),
            expected_version,
            events,
        })
    }
}

/// Event store operation error.
///
/// Infrastructure failures (storage, concurrency, isolation), as opposed to
/// domain rejections.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only, tenant-scoped event store.
///
/// Streams are keyed by `(tenant_id, aggregate_id)`. A multi-stream append
/// ([`EventStore::append_all`]) checks every stream's expected version and
/// persists all of them or none.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append to several streams atomically. All streams must belong to one tenant.
    async fn append_all(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a tenant + aggregate, in sequence order.
    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Ids of every non-empty stream of `aggregate_type` for a tenant.
    async fn list_streams(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError>;

    /// Tenants with at least one stream.
    async fn tenants(&self) -> Result<Vec<TenantId>, EventStoreError>;

    /// Append to a single aggregate stream.
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        match StreamAppend::from_events(events, expected_version) {
            Some(stream) => self.append_all(vec![stream]).await,
            None => Ok(vec![]),
        }
    }

    /// Current version of every non-empty stream of `aggregate_type`.
    async fn stream_heads(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<(AggregateId, u64)>, EventStoreError> {
        let mut heads = Vec::new();
        for aggregate_id in self.list_streams(tenant_id, aggregate_type).await? {
            let stream = self.load_stream(tenant_id, aggregate_id).await?;
            if let Some(last) = stream.last() {
                heads.push((aggregate_id, last.sequence_number));
            }
        }
        Ok(heads)
    }

    /// Events of one stream with a sequence number above `after`.
    async fn load_stream_after(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut stream = self.load_stream(tenant_id, aggregate_id).await?;
        stream.retain(|e| e.sequence_number > after);
        Ok(stream)
    }

    /// Every event of `aggregate_type` for a tenant, ordered by stream then sequence.
    async fn load_by_type(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut all = Vec::new();
        for aggregate_id in self.list_streams(tenant_id, aggregate_type).await? {
            all.extend(self.load_stream(tenant_id, aggregate_id).await?);
        }
        Ok(all)
    }
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_all(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append_all(batch).await
    }

    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id).await
    }

    async fn list_streams(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        (**self).list_streams(tenant_id, aggregate_type).await
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, EventStoreError> {
        (**self).tenants().await
    }

    async fn stream_heads(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<(AggregateId, u64)>, EventStoreError> {
        (**self).stream_heads(tenant_id, aggregate_type).await
    }

    async fn load_stream_after(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream_after(tenant_id, aggregate_id, after).await
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: shopfloor_events::Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            payload,
        })
    }
}

/// Structural checks shared by every backend, run before touching storage.
///
/// Returns `false` when there is nothing to append.
pub(crate) fn validate_batch(batch: &[StreamAppend]) -> Result<bool, EventStoreError> {
    let Some(first) = batch.first() else {
        return Ok(false);
    };
    let tenant_id = first.tenant_id;
    let mut seen = HashSet::new();

    for (s_idx, stream) in batch.iter().enumerate() {
        if stream.tenant_id != tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch spans multiple tenants (stream {s_idx})"
            )));
        }
        if !seen.insert(stream.aggregate_id) {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {} appears twice in one batch",
                stream.aggregate_id
            )));
        }
        if stream.events.is_empty() {
            return Err(EventStoreError::InvalidAppend(format!(
                "empty event list for stream {}",
                stream.aggregate_id
            )));
        }
        for (idx, e) in stream.events.iter().enumerate() {
            if e.tenant_id != stream.tenant_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "stream {s_idx} contains a foreign tenant_id (index {idx})"
                )));
            }
            if e.aggregate_id != stream.aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "stream {s_idx} contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != stream.aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream {s_idx} contains multiple aggregate_types (index {idx})"
                )));
            }
        }
    }

    Ok(true)
}
