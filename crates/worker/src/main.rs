//! Background worker: keeps the stock read model current and runs the
//! scheduled low-stock and consistency alerts.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use shopfloor_events::{EventEnvelope, InMemoryEventBus};
use shopfloor_infra::alerts::{LedgerAlertSource, TracingAlertSink};
use shopfloor_infra::command_dispatcher::CommandDispatcher;
use shopfloor_infra::config::{LogFormat, Settings};
use shopfloor_infra::db;
use shopfloor_infra::event_store::{EventStore, PostgresEventStore};
use shopfloor_infra::ledger::{ConsistencyChecker, PostgresDiscrepancyLog, StockLedger};
use shopfloor_infra::projections::{BatchReadModel, StockProjection, StockReadModel};
use shopfloor_infra::read_model::InMemoryTenantStore;
use shopfloor_infra::workers::ProjectionWorker;
use shopfloor_inventory::{Batch, BatchId, InventoryItem, InventoryItemId};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Projection = StockProjection<
    Arc<InMemoryTenantStore<InventoryItemId, StockReadModel>>,
    Arc<InMemoryTenantStore<BatchId, BatchReadModel>>,
>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load configuration")?;
    let format = match settings.log.format {
        LogFormat::Json => shopfloor_observability::LogFormat::Json,
        LogFormat::Pretty => shopfloor_observability::LogFormat::Pretty,
    };
    shopfloor_observability::init(format, &settings.log.filter);
    info!(environment = %settings.environment, "starting shopfloor worker");

    let pool = db::connect(&settings.database)
        .await
        .context("failed to connect to Postgres")?;
    if settings.database.migrate {
        db::migrate(&pool).await.context("failed to run migrations")?;
    }

    let store = Arc::new(PostgresEventStore::new(pool.clone()));
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let projection: Arc<Projection> = Arc::new(StockProjection::new(
        Arc::new(InMemoryTenantStore::new()),
        Arc::new(InMemoryTenantStore::new()),
    ));
    rebuild(&store, &projection).await?;

    let sink = projection.clone();
    let projection_worker = ProjectionWorker::spawn(
        "stock-projection",
        &bus,
        None,
        move |env: EventEnvelope<JsonValue>| sink.apply_envelope(&env),
    )
    .context("failed to spawn projection worker")?;

    let ledger = StockLedger::new(Arc::new(CommandDispatcher::new(store.clone(), bus)));
    let checker = Arc::new(ConsistencyChecker::new(
        ledger,
        projection.clone(),
        PostgresDiscrepancyLog::new(pool.clone()),
    ));

    let alerts = if settings.alerts.enabled {
        let source = Arc::new(LedgerAlertSource::new(store.clone(), projection.clone(), checker));
        Some(settings.alerts.runner().spawn("stock-alerts", source, Arc::new(TracingAlertSink)))
    } else {
        info!("stock alerts disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    if let Some(handle) = alerts {
        handle.shutdown().await;
    }
    if let Err(e) = tokio::task::spawn_blocking(move || projection_worker.shutdown()).await {
        warn!(error = %e, "projection worker did not stop cleanly");
    }
    pool.close().await;

    info!("shopfloor worker stopped");
    Ok(())
}

/// Replay every tenant's item and batch streams into the read model.
async fn rebuild(store: &Arc<PostgresEventStore>, projection: &Projection) -> anyhow::Result<()> {
    let mut envelopes = Vec::new();
    for tenant_id in store.tenants().await? {
        for aggregate_type in [InventoryItem::AGGREGATE_TYPE, Batch::AGGREGATE_TYPE] {
            envelopes.extend(
                store
                    .load_by_type(tenant_id, aggregate_type)
                    .await?
                    .iter()
                    .map(|e| e.to_envelope()),
            );
        }
    }
    let count = envelopes.len();
    projection
        .rebuild_from_scratch(envelopes)
        .context("failed to rebuild stock projection")?;
    info!(events = count, "stock projection rebuilt");
    Ok(())
}
