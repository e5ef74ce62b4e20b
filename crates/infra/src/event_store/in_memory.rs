use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use shopfloor_core::{AggregateId, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, validate_batch};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    tenant_id: TenantId,
    aggregate_id: AggregateId,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. A multi-stream append runs entirely under one write
/// lock, so it is all-or-nothing.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamKey, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_all(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if !validate_batch(&batch)? {
            return Ok(vec![]);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        // Check every stream before writing any of them.
        for append in &batch {
            let key = StreamKey {
                tenant_id: append.tenant_id,
                aggregate_id: append.aggregate_id,
            };
            let stream = streams.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let current = Self::current_version(stream);

            if !append.expected_version.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    append.aggregate_id, append.expected_version
                )));
            }

            if let Some(existing) = stream.first() {
                if existing.aggregate_type != append.aggregate_type {
                    return Err(EventStoreError::AggregateTypeMismatch(format!(
                        "stream aggregate_type is '{}', attempted append with '{}'",
                        existing.aggregate_type, append.aggregate_type
                    )));
                }
            }
        }

        let mut committed = Vec::new();
        for append in batch {
            let key = StreamKey {
                tenant_id: append.tenant_id,
                aggregate_id: append.aggregate_id,
            };
            let stream = streams.entry(key).or_default();
            let mut next = Self::current_version(stream) + 1;

            for e in append.events {
                let stored = StoredEvent {
                    event_id: e.event_id,
                    tenant_id: e.tenant_id,
                    aggregate_id: e.aggregate_id,
                    aggregate_type: e.aggregate_type,
                    sequence_number: next,
                    event_type: e.event_type,
                    event_version: e.event_version,
                    occurred_at: e.occurred_at,
                    payload: e.payload,
                };
                next += 1;
                stream.push(stored.clone());
                committed.push(stored);
            }
        }

        Ok(committed)
    }

    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(streams.get(&key).cloned().unwrap_or_default())
    }

    async fn list_streams(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        let ids: BTreeSet<AggregateId> = streams
            .iter()
            .filter(|(key, events)| {
                key.tenant_id == tenant_id
                    && events.first().is_some_and(|e| e.aggregate_type == aggregate_type)
            })
            .map(|(key, _)| key.aggregate_id)
            .collect();

        Ok(ids.into_iter().collect())
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        let tenants: BTreeSet<TenantId> = streams.keys().map(|k| k.tenant_id).collect();
        Ok(tenants.into_iter().collect())
    }

    async fn stream_heads(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<(AggregateId, u64)>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        let mut heads: Vec<(AggregateId, u64)> = streams
            .iter()
            .filter(|(key, _)| key.tenant_id == tenant_id)
            .filter_map(|(key, events)| {
                let first = events.first()?;
                (first.aggregate_type == aggregate_type)
                    .then(|| (key.aggregate_id, Self::current_version(events)))
            })
            .collect();
        heads.sort();
        Ok(heads)
    }

    async fn load_stream_after(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let key = StreamKey {
            tenant_id,
            aggregate_id,
        };

        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Backend("lock poisoned".to_string()))?;

        Ok(streams
            .get(&key)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::r#trait::UncommittedEvent;
    use chrono::Utc;
    use shopfloor_core::ExpectedVersion;
    use uuid::Uuid;

    fn event(tenant_id: TenantId, aggregate_id: AggregateId, aggregate_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            event_type: "test.happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    fn stream(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        expected: ExpectedVersion,
        count: usize,
    ) -> StreamAppend {
        StreamAppend {
            tenant_id,
            aggregate_id,
            aggregate_type: "test.aggregate".to_string(),
            expected_version: expected,
            events: (0..count)
                .map(|_| event(tenant_id, aggregate_id, "test.aggregate"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn assigns_sequence_numbers_per_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        let committed = store
            .append_all(vec![
                stream(tenant_id, a, ExpectedVersion::Exact(0), 2),
                stream(tenant_id, b, ExpectedVersion::Exact(0), 1),
            ])
            .await
            .unwrap();

        let seqs: Vec<u64> = committed.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 1]);
        assert_eq!(store.load_stream(tenant_id, a).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn multi_stream_append_is_all_or_nothing() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append_all(vec![stream(tenant_id, b, ExpectedVersion::Exact(0), 1)])
            .await
            .unwrap();

        // `b` is stale: neither stream may change.
        let err = store
            .append_all(vec![
                stream(tenant_id, a, ExpectedVersion::Exact(0), 1),
                stream(tenant_id, b, ExpectedVersion::Exact(0), 1),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert!(store.load_stream(tenant_id, a).await.unwrap().is_empty());
        assert_eq!(store.load_stream(tenant_id, b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_cross_tenant_batches() {
        let store = InMemoryEventStore::new();

        let err = store
            .append_all(vec![
                stream(TenantId::new(), AggregateId::new(), ExpectedVersion::Any, 1),
                stream(TenantId::new(), AggregateId::new(), ExpectedVersion::Any, 1),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::TenantIsolation(_)));
    }

    #[tokio::test]
    async fn lists_streams_by_type_and_tenant() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let other = TenantId::new();
        let a = AggregateId::new();

        store.append(vec![event(tenant_id, a, "inventory.item")], ExpectedVersion::Exact(0)).await.unwrap();
        store
            .append(vec![event(tenant_id, AggregateId::new(), "inventory.batch")], ExpectedVersion::Exact(0))
            .await
            .unwrap();
        store
            .append(vec![event(other, AggregateId::new(), "inventory.item")], ExpectedVersion::Exact(0))
            .await
            .unwrap();

        assert_eq!(store.list_streams(tenant_id, "inventory.item").await.unwrap(), vec![a]);
        assert_eq!(store.tenants().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn heads_and_tails_skip_what_was_already_read() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append(
                vec![
                    event(tenant_id, a, "inventory.item"),
                    event(tenant_id, a, "inventory.item"),
                    event(tenant_id, a, "inventory.item"),
                ],
                ExpectedVersion::Exact(0),
            )
            .await
            .unwrap();
        store.append(vec![event(tenant_id, b, "inventory.batch")], ExpectedVersion::Exact(0)).await.unwrap();

        assert_eq!(store.stream_heads(tenant_id, "inventory.item").await.unwrap(), vec![(a, 3)]);
        assert!(store.stream_heads(TenantId::new(), "inventory.item").await.unwrap().is_empty());

        let tail = store.load_stream_after(tenant_id, a, 1).await.unwrap();
        let seqs: Vec<u64> = tail.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(store.load_stream_after(tenant_id, a, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn aggregate_type_is_stable_per_stream() {
        let store = InMemoryEventStore::new();
        let tenant_id = TenantId::new();
        let a = AggregateId::new();

        store.append(vec![event(tenant_id, a, "inventory.item")], ExpectedVersion::Any).await.unwrap();
        let err = store
            .append(vec![event(tenant_id, a, "inventory.batch")], ExpectedVersion::Any)
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::AggregateTypeMismatch(_)));
    }
}
