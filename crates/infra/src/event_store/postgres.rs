//! Postgres-backed event store.
//!
//! ## Locking
//!
//! Every stream has a head row in `streams`. An append takes `SELECT … FOR UPDATE`
//! on the head row of each affected stream (in a fixed order), checks the
//! expected version, inserts the events and bumps the head, all in one
//! transaction. Two writers touching the same item serialize on its head row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | EventStoreError |
//! |------------|-----------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (check / FK violation) | `23514` / `23503` | `InvalidAppend` |
//! | Database (other) | any | `Backend` |
//! | PoolClosed, Io, other | n/a | `Backend` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use shopfloor_core::{AggregateId, TenantId};

use super::r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, validate_batch};

/// Postgres-backed append-only event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, batch),
        fields(stream_count = batch.len(), committed_events = tracing::field::Empty),
        err
    )]
    async fn append_all(&self, mut batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        if !validate_batch(&batch)? {
            return Ok(vec![]);
        }

        // Fixed lock order across writers.
        batch.sort_by_key(|s| *s.aggregate_id.as_uuid());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut committed = Vec::new();

        for append in batch {
            let (current_version, existing_type) = lock_stream(&mut tx, &append).await?;

            if existing_type != append.aggregate_type {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing_type, append.aggregate_type
                )));
            }

            if !append.expected_version.matches(current_version) {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {}",
                    append.aggregate_id, append.expected_version, current_version
                )));
            }

            let mut next_sequence = current_version + 1;
            for event in append.events {
                sqlx::query(
                    r#"
                    INSERT INTO events (
                        event_id,
                        tenant_id,
                        aggregate_id,
                        aggregate_type,
                        sequence_number,
                        event_type,
                        event_version,
                        occurred_at,
                        payload
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(event.event_id)
                .bind(append.tenant_id.as_uuid())
                .bind(append.aggregate_id.as_uuid())
                .bind(&append.aggregate_type)
                .bind(next_sequence as i64)
                .bind(&event.event_type)
                .bind(event.event_version as i32)
                .bind(event.occurred_at)
                .bind(&event.payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EventStoreError::Concurrency(format!(
                            "concurrent append detected: sequence_number {next_sequence} already exists"
                        ))
                    } else {
                        map_sqlx_error("insert_event", e)
                    }
                })?;

                committed.push(StoredEvent {
                    event_id: event.event_id,
                    tenant_id: event.tenant_id,
                    aggregate_id: event.aggregate_id,
                    aggregate_type: event.aggregate_type,
                    sequence_number: next_sequence,
                    event_type: event.event_type,
                    event_version: event.event_version,
                    occurred_at: event.occurred_at,
                    payload: event.payload,
                });
                next_sequence += 1;
            }

            sqlx::query(
                r#"
                UPDATE streams
                SET version = $3, updated_at = NOW()
                WHERE tenant_id = $1 AND aggregate_id = $2
                "#,
            )
            .bind(append.tenant_id.as_uuid())
            .bind(append.aggregate_id.as_uuid())
            .bind((next_sequence - 1) as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_stream_head", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            aggregate_id = %aggregate_id.as_uuid(),
            event_count = tracing::field::Empty
        ),
        err
    )]
    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row)
                .map_err(|e| EventStoreError::Backend(format!("failed to decode event row: {e}")))?;
            stored_events.push(stored.into());
        }

        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid()), err)]
    async fn list_streams(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<AggregateId>, EventStoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT aggregate_id
            FROM streams
            WHERE tenant_id = $1 AND aggregate_type = $2 AND version > 0
            ORDER BY aggregate_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_streams", e))?;

        Ok(ids.into_iter().map(AggregateId::from_uuid).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id.as_uuid()), err)]
    async fn stream_heads(
        &self,
        tenant_id: TenantId,
        aggregate_type: &str,
    ) -> Result<Vec<(AggregateId, u64)>, EventStoreError> {
        let rows: Vec<(uuid::Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT aggregate_id, version
            FROM streams
            WHERE tenant_id = $1 AND aggregate_type = $2 AND version > 0
            ORDER BY aggregate_id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_type)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_heads", e))?;

        rows.into_iter()
            .map(|(id, version)| {
                let version = u64::try_from(version)
                    .map_err(|_| EventStoreError::Backend(format!("negative stream version {version}")))?;
                Ok((AggregateId::from_uuid(id), version))
            })
            .collect()
    }

    #[instrument(
        skip(self),
        fields(
            tenant_id = %tenant_id.as_uuid(),
            aggregate_id = %aggregate_id.as_uuid(),
            event_count = tracing::field::Empty
        ),
        err
    )]
    async fn load_stream_after(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let after = i64::try_from(after)
            .map_err(|_| EventStoreError::Backend(format!("sequence number {after} out of range")))?;
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2 AND sequence_number > $3
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .bind(after)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream_after", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row)
                .map_err(|e| EventStoreError::Backend(format!("failed to decode event row: {e}")))?;
            stored_events.push(stored.into());
        }

        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(skip(self), err)]
    async fn tenants(&self) -> Result<Vec<TenantId>, EventStoreError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            "SELECT DISTINCT tenant_id FROM streams WHERE version > 0 ORDER BY tenant_id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tenants", e))?;

        Ok(ids.into_iter().map(TenantId::from_uuid).collect())
    }
}

/// Create the head row if missing, then lock it.
///
/// Returns `(current_version, aggregate_type)`.
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    append: &StreamAppend,
) -> Result<(u64, String), EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO streams (tenant_id, aggregate_id, aggregate_type, version)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (tenant_id, aggregate_id) DO NOTHING
        "#,
    )
    .bind(append.tenant_id.as_uuid())
    .bind(append.aggregate_id.as_uuid())
    .bind(&append.aggregate_type)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("ensure_stream", e))?;

    let row = sqlx::query(
        r#"
        SELECT version, aggregate_type
        FROM streams
        WHERE tenant_id = $1 AND aggregate_id = $2
        FOR UPDATE
        "#,
    )
    .bind(append.tenant_id.as_uuid())
    .bind(append.aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_stream", e))?;

    let version: i64 = row
        .try_get("version")
        .map_err(|e| EventStoreError::Backend(format!("failed to read version: {e}")))?;
    let aggregate_type: String = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Backend(format!("failed to read aggregate_type: {e}")))?;

    Ok((version as u64, aggregate_type))
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23503") | Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            EventStoreError::Backend(format!("unexpected row not found in {operation}"))
        }
        other => EventStoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}
