//! End-to-end workflow tests.
//!
//! Workflow service -> dispatcher -> event store -> bus -> projection worker
//! -> read model, checked against the ledger replay.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use serde_json::Value as JsonValue;

    use shopfloor_core::{Quantity, TenantId};
    use shopfloor_events::{EventEnvelope, InMemoryEventBus};
    use shopfloor_inventory::{
        BatchId, BatchNumber, InventoryItemId, MovementRequest, ProcessName, QualityStatus, ReceiptState,
        SourceDocument, SourceKind, StockPosting,
    };
    use shopfloor_jobwork::{JobWork, JobWorkStatus};
    use shopfloor_production::{BillOfMaterials, BomComponent, ProductionStatus};
    use shopfloor_purchasing::{PurchaseOrderId, PurchaseOrderStatus};
    use shopfloor_receiving::{GrnStatus, ReceiptSource};

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::ledger::{ConsistencyChecker, InMemoryDiscrepancyLog, NewBatch, NewItem, StockLedger};
    use crate::projections::{BatchReadModel, StockProjection, StockReadModel};
    use crate::read_model::InMemoryTenantStore;
    use crate::workers::{ProjectionWorker, WorkerHandle};
    use crate::workflows::{
        JobWorkService, NewGoodsReceipt, ProductionService, PurchaseLine, PurchasingService,
        ReceivingService,
    };

    type Store = Arc<InMemoryEventStore>;
    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Items = Arc<InMemoryTenantStore<InventoryItemId, StockReadModel>>;
    type Batches = Arc<InMemoryTenantStore<BatchId, BatchReadModel>>;

    struct Plant {
        store: Store,
        ledger: StockLedger<Store, Bus>,
        purchasing: PurchasingService<Store, Bus>,
        receiving: ReceivingService<Store, Bus>,
        job_work: JobWorkService<Store, Bus>,
        production: ProductionService<Store, Bus>,
        projection: Arc<StockProjection<Items, Batches>>,
        worker: Option<WorkerHandle>,
    }

    impl Plant {
        fn new() -> Self {
            let store: Store = Arc::new(InMemoryEventStore::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let projection = Arc::new(StockProjection::new(
                Arc::new(InMemoryTenantStore::new()),
                Arc::new(InMemoryTenantStore::new()),
            ));

            // Subscribe before anything is published.
            let sink = projection.clone();
            let worker = ProjectionWorker::spawn("stock-projection", &bus, None, move |env: EventEnvelope<JsonValue>| {
                sink.apply_envelope(&env)
            })
            .unwrap();

            let ledger = StockLedger::new(Arc::new(CommandDispatcher::new(store.clone(), bus)));
            Self {
                store,
                purchasing: PurchasingService::new(ledger.clone()),
                receiving: ReceivingService::new(ledger.clone()),
                job_work: JobWorkService::new(ledger.clone()),
                production: ProductionService::new(ledger.clone()),
                ledger,
                projection,
                worker: Some(worker),
            }
        }

        async fn item(&self, tenant_id: TenantId, code: &str) -> InventoryItemId {
            self.ledger
                .register_item(
                    tenant_id,
                    NewItem {
                        code: code.to_string(),
                        name: format!("{code} part"),
                        unit_of_measure: "nos".to_string(),
                        minimum_stock: None,
                    },
                )
                .await
                .unwrap()
        }

        async fn stocked(&self, tenant_id: TenantId, code: &str, raw: u32) -> InventoryItemId {
            let item_id = self.item(tenant_id, code).await;
            self.ledger
                .receive_external(tenant_id, item_id, ReceiptState::Raw, Quantity::from(raw), opening())
                .await
                .unwrap();
            item_id
        }

        async fn sent_order(&self, tenant_id: TenantId, item_id: InventoryItemId, qty: u32) -> PurchaseOrderId {
            let order_id = self
                .purchasing
                .create_order(
                    tenant_id,
                    "PO-2410-001",
                    "Steel Traders",
                    vec![PurchaseLine {
                        item_id,
                        quantity: Quantity::from(qty),
                        destination: ReceiptState::Raw,
                    }],
                )
                .await
                .unwrap();
            self.purchasing.send(tenant_id, order_id).await.unwrap();
            order_id
        }

        /// Open a batch and receive `raw` into it.
        async fn lot(
            &self,
            tenant_id: TenantId,
            item_id: InventoryItemId,
            number: &str,
            quality: QualityStatus,
            raw: u32,
        ) -> BatchId {
            let batch_id = self
                .ledger
                .open_batch(
                    tenant_id,
                    item_id,
                    NewBatch {
                        batch_number: Some(BatchNumber::new(number).unwrap()),
                        origin: opening(),
                        quality,
                        expiry_date: None,
                    },
                )
                .await
                .unwrap();
            let receipt = MovementRequest::ReceiveExternal {
                state: ReceiptState::Raw,
                quantity: Quantity::from(raw),
            };
            self.ledger
                .post(tenant_id, StockPosting::new(item_id, receipt, opening()), Some(batch_id))
                .await
                .unwrap();
            // Keeps opening times strictly ordered.
            tokio::time::sleep(Duration::from_millis(2)).await;
            batch_id
        }

        /// Wait until the projection row matches the aggregate's levels.
        async fn settled(&self, tenant_id: TenantId, item_id: InventoryItemId) -> StockReadModel {
            let expected = self.ledger.stock_levels(tenant_id, item_id).await.unwrap();
            for _ in 0..100 {
                if let Some(row) = self.projection.get(tenant_id, &item_id) {
                    if row.levels == expected {
                        return row;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("projection did not catch up for {item_id}");
        }
    }

    impl Drop for Plant {
        fn drop(&mut self) {
            if let Some(worker) = self.worker.take() {
                worker.shutdown();
            }
        }
    }

    fn opening() -> SourceDocument {
        SourceDocument::new(SourceKind::Adjustment, "OPENING").unwrap()
    }

    fn cutting() -> ProcessName {
        ProcessName::new("cutting").unwrap()
    }

    fn po_receipt(order_id: PurchaseOrderId, item_id: InventoryItemId, grn: &str, qty: u32) -> NewGoodsReceipt {
        NewGoodsReceipt {
            grn_number: grn.to_string(),
            source: ReceiptSource::PurchaseOrder { order_id, line_no: 1 },
            item_id,
            quantity: Quantity::from(qty),
            batch_number: None,
            expiry_date: None,
        }
    }

    #[tokio::test]
    async fn purchase_receipt_inspected_and_posted_to_raw() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "STL-10").await;
        let order_id = plant.sent_order(tenant_id, item_id, 50).await;

        let grn_id = plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0001", 30))
            .await
            .unwrap();
        // Nothing reaches stock before posting.
        assert!(plant.ledger.stock_levels(tenant_id, item_id).await.unwrap().raw().is_zero());

        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(28), Quantity::from(2), None)
            .await
            .unwrap();
        let posted = plant.receiving.post(tenant_id, grn_id).await.unwrap();

        assert_eq!(posted.levels.raw(), Quantity::from(28));
        assert_eq!(posted.batch_id, None);
        assert_eq!(plant.receiving.receipt(tenant_id, grn_id).await.unwrap().status(), GrnStatus::Posted);

        let order = plant.purchasing.order(tenant_id, order_id).await.unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::PartiallyReceived);
        assert_eq!(order.line(1).unwrap().quantity_received(), Quantity::from(28));

        let row = plant.settled(tenant_id, item_id).await;
        assert_eq!(row.levels.raw(), Quantity::from(28));
        assert!(row.last_movement_at.is_some());
    }

    #[tokio::test]
    async fn partial_receipts_add_up_to_a_single_receipt() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let split = plant.item(tenant_id, "STL-10").await;
        let whole = plant.item(tenant_id, "STL-20").await;
        let split_po = plant.sent_order(tenant_id, split, 50).await;
        let whole_po = plant.sent_order(tenant_id, whole, 50).await;

        for (po, item, grn, qty) in [
            (split_po, split, "GRN-0001", 30),
            (split_po, split, "GRN-0002", 20),
            (whole_po, whole, "GRN-0003", 50),
        ] {
            let grn_id = plant.receiving.record(tenant_id, po_receipt(po, item, grn, qty)).await.unwrap();
            plant
                .receiving
                .inspect(tenant_id, grn_id, Quantity::from(qty), Quantity::ZERO, None)
                .await
                .unwrap();
            plant.receiving.post(tenant_id, grn_id).await.unwrap();
        }

        let split_levels = plant.ledger.stock_levels(tenant_id, split).await.unwrap();
        let whole_levels = plant.ledger.stock_levels(tenant_id, whole).await.unwrap();
        assert_eq!(split_levels, whole_levels);

        let order = plant.purchasing.order(tenant_id, split_po).await.unwrap();
        assert_eq!(order.status(), PurchaseOrderStatus::Received);
        assert_eq!(order.completion().outstanding(), Quantity::ZERO);
    }

    #[tokio::test]
    async fn over_receipt_is_refused_at_the_gate() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "STL-10").await;
        let order_id = plant.sent_order(tenant_id, item_id, 50).await;

        let err = plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0001", 51))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn receipts_against_a_draft_order_are_refused() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "STL-10").await;
        let order_id = plant
            .purchasing
            .create_order(
                tenant_id,
                "PO-2410-002",
                "Steel Traders",
                vec![PurchaseLine {
                    item_id,
                    quantity: Quantity::from(10),
                    destination: ReceiptState::Raw,
                }],
            )
            .await
            .unwrap();

        let err = plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0001", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn job_work_issue_and_inspected_return() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 100).await;

        let (job_id, levels) = plant
            .job_work
            .issue(tenant_id, "JW-0001", "Sharma Cutting Works", item_id, cutting(), Quantity::from(40))
            .await
            .unwrap();
        assert_eq!(levels.raw(), Quantity::from(60));
        assert_eq!(levels.wip(&cutting()), Quantity::from(40));

        let grn_id = plant
            .receiving
            .record(
                tenant_id,
                NewGoodsReceipt {
                    grn_number: "GRN-0101".to_string(),
                    source: ReceiptSource::JobWork {
                        job_id,
                        process: cutting(),
                    },
                    item_id,
                    quantity: Quantity::from(40),
                    batch_number: None,
                    expiry_date: None,
                },
            )
            .await
            .unwrap();
        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(38), Quantity::from(2), Some("burrs".to_string()))
            .await
            .unwrap();
        let posted = plant.receiving.post(tenant_id, grn_id).await.unwrap();

        assert_eq!(posted.levels.wip(&cutting()), Quantity::ZERO);
        assert_eq!(posted.levels.finished(), Quantity::from(38));
        assert_eq!(posted.levels.scrap(), Quantity::from(2));
        assert_eq!(posted.levels.raw(), Quantity::from(60));

        let job = plant.job_work.job(tenant_id, job_id).await.unwrap();
        assert_eq!(job.status(), JobWorkStatus::Completed);
        assert_eq!(job.passed(), Quantity::from(38));
        assert_eq!(job.scrap(), Quantity::from(2));

        let row = plant.settled(tenant_id, item_id).await;
        assert!(row.levels.wip_buckets().is_empty());
    }

    #[tokio::test]
    async fn unused_job_work_material_returns_to_raw() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 100).await;

        let (job_id, _) = plant
            .job_work
            .issue(tenant_id, "JW-0002", "Sharma Cutting Works", item_id, cutting(), Quantity::from(40))
            .await
            .unwrap();
        let levels = plant.job_work.return_unused(tenant_id, job_id, Quantity::from(5)).await.unwrap();

        assert_eq!(levels.raw(), Quantity::from(65));
        assert_eq!(levels.wip(&cutting()), Quantity::from(35));
        let job = plant.job_work.job(tenant_id, job_id).await.unwrap();
        assert_eq!(job.returned(), Quantity::from(5));
        assert_eq!(job.status(), JobWorkStatus::PartiallyReceived);
    }

    #[tokio::test]
    async fn insufficient_raw_rejects_the_whole_job() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 10).await;
        let before = plant.ledger.stock_levels(tenant_id, item_id).await.unwrap();
        let streams_before = plant.store.list_streams(tenant_id, JobWork::AGGREGATE_TYPE).await.unwrap();

        let err = plant
            .job_work
            .issue(tenant_id, "JW-0003", "Sharma Cutting Works", item_id, cutting(), Quantity::from(15))
            .await
            .unwrap_err();

        match &err {
            DispatchError::InsufficientStock {
                state,
                available,
                requested,
            } => {
                assert_eq!(state, "raw");
                assert_eq!(*available, Decimal::from(10));
                assert_eq!(*requested, Decimal::from(15));
            }
            other => panic!("expected insufficient stock, got {other:?}"),
        }
        assert!(err.is_rejection());
        assert_eq!(plant.ledger.stock_levels(tenant_id, item_id).await.unwrap(), before);
        assert_eq!(plant.store.list_streams(tenant_id, JobWork::AGGREGATE_TYPE).await.unwrap(), streams_before);
        assert_eq!(plant.ledger.movement_history(tenant_id, item_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn production_order_turns_components_into_finished_output() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let frame = plant.item(tenant_id, "FRM-500").await;
        let tube = plant.stocked(tenant_id, "TUB-25", 100).await;
        let welding = ProcessName::new("welding").unwrap();

        let bom = BillOfMaterials::new(
            frame,
            Quantity::from(1),
            vec![BomComponent {
                item_id: tube,
                quantity_required: Quantity::from(2),
                process: welding.clone(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();

        assert!(plant
            .production
            .check_availability(tenant_id, &bom, Quantity::from(10))
            .await
            .unwrap()
            .is_empty());
        let short = plant
            .production
            .check_availability(tenant_id, &bom, Quantity::from(60))
            .await
            .unwrap();
        assert_eq!(short.len(), 1);
        assert_eq!(short[0].shortage, Quantity::from(20));

        let order_id = plant.production.plan(tenant_id, "MO-0001", bom, Quantity::from(10)).await.unwrap();
        let levels = plant.production.issue_material(tenant_id, order_id, tube, Quantity::from(20)).await.unwrap();
        assert_eq!(levels.raw(), Quantity::from(80));
        assert_eq!(levels.wip(&welding), Quantity::from(20));
        assert!(plant.production.shortages_for_order(tenant_id, order_id).await.unwrap().is_empty());

        let levels = plant.production.consume_material(tenant_id, order_id, tube, Quantity::from(20)).await.unwrap();
        assert!(levels.wip_total().is_zero());

        let output = plant
            .production
            .record_output(tenant_id, order_id, Quantity::from(9), Quantity::from(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.finished(), Quantity::from(9));
        assert!(output.scrap().is_zero());

        plant.production.complete(tenant_id, order_id).await.unwrap();
        let order = plant.production.order(tenant_id, order_id).await.unwrap();
        assert_eq!(order.status(), ProductionStatus::Completed);
        assert_eq!(order.produced(), Quantity::from(9));
        assert_eq!(order.damaged(), Quantity::from(1));
    }

    #[tokio::test]
    async fn damaged_only_output_books_no_stock() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let frame = plant.item(tenant_id, "FRM-500").await;
        let tube = plant.stocked(tenant_id, "TUB-25", 10).await;
        let bom = BillOfMaterials::new(
            frame,
            Quantity::from(1),
            vec![BomComponent {
                item_id: tube,
                quantity_required: Quantity::from(1),
                process: ProcessName::new("welding").unwrap(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();
        let order_id = plant.production.plan(tenant_id, "MO-0002", bom, Quantity::from(5)).await.unwrap();
        plant.production.issue_material(tenant_id, order_id, tube, Quantity::from(1)).await.unwrap();

        let output = plant
            .production
            .record_output(tenant_id, order_id, Quantity::ZERO, Quantity::from(1))
            .await
            .unwrap();
        assert_eq!(output, None);
        assert!(plant.ledger.stock_levels(tenant_id, frame).await.unwrap().finished().is_zero());
    }

    #[tokio::test]
    async fn projection_stays_consistent_with_the_ledger() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 100).await;
        let (job_id, _) = plant
            .job_work
            .issue(tenant_id, "JW-0004", "Sharma Cutting Works", item_id, cutting(), Quantity::from(40))
            .await
            .unwrap();
        plant.job_work.return_unused(tenant_id, job_id, Quantity::from(10)).await.unwrap();
        plant.settled(tenant_id, item_id).await;

        let checker = ConsistencyChecker::new(
            plant.ledger.clone(),
            plant.projection.clone(),
            Arc::new(InMemoryDiscrepancyLog::new()),
        );
        let report = checker.check_tenant(tenant_id).await.unwrap();
        assert_eq!(report.items_checked, 1);
        assert!(report.is_consistent(), "{:?}", report.discrepancies);

        let replayed = checker.recompute_from_ledger(tenant_id, item_id).await.unwrap();
        assert_eq!(replayed.levels, plant.ledger.stock_levels(tenant_id, item_id).await.unwrap());
        assert!(replayed.overdrawn.is_empty());
    }

    #[tokio::test]
    async fn tenants_never_see_each_others_stock() {
        let plant = Plant::new();
        let a = TenantId::new();
        let b = TenantId::new();
        let item_id = plant.stocked(a, "BRK-100", 100).await;

        let err = plant.ledger.stock_levels(b, item_id).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound | DispatchError::TenantIsolation(_)));

        plant.settled(a, item_id).await;
        assert!(plant.projection.get(b, &item_id).is_none());
        assert!(plant.projection.list(b).is_empty());
    }

    #[tokio::test]
    async fn fifo_issue_draws_oldest_good_batches_first() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "TUB-25").await;
        let first = plant.lot(tenant_id, item_id, "TUB-2410-001", QualityStatus::Good, 30).await;
        let second = plant.lot(tenant_id, item_id, "TUB-2410-002", QualityStatus::Good, 30).await;
        let held = plant
            .lot(tenant_id, item_id, "TUB-2410-003", QualityStatus::PendingInspection, 10)
            .await;

        let issue = MovementRequest::MoveToWip {
            process: cutting(),
            quantity: Quantity::from(40),
        };
        let (levels, drawn) = plant
            .ledger
            .post_fifo(tenant_id, StockPosting::new(item_id, issue, opening()))
            .await
            .unwrap();
        assert_eq!(drawn, vec![(first, Quantity::from(30)), (second, Quantity::from(10))]);
        assert_eq!(levels.raw(), Quantity::from(30));
        assert_eq!(levels.wip(&cutting()), Quantity::from(40));
        assert!(plant.ledger.batch(tenant_id, first).await.unwrap().levels().raw().is_zero());

        // The held batch is skipped until it passes inspection.
        let too_much = MovementRequest::MoveToWip {
            process: cutting(),
            quantity: Quantity::from(25),
        };
        let err = plant
            .ledger
            .post_fifo(tenant_id, StockPosting::new(item_id, too_much.clone(), opening()))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientStock { .. }));

        plant
            .ledger
            .change_batch_quality(tenant_id, held, QualityStatus::Good)
            .await
            .unwrap();
        let (_, drawn) = plant
            .ledger
            .post_fifo(tenant_id, StockPosting::new(item_id, too_much, opening()))
            .await
            .unwrap();
        assert_eq!(drawn, vec![(second, Quantity::from(20)), (held, Quantity::from(5))]);
    }

    #[tokio::test]
    async fn production_issue_can_draw_from_batches() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let frame = plant.item(tenant_id, "FRM-500").await;
        let tube = plant.item(tenant_id, "TUB-25").await;
        let old = plant.lot(tenant_id, tube, "TUB-2409-001", QualityStatus::Good, 8).await;
        let new = plant.lot(tenant_id, tube, "TUB-2410-001", QualityStatus::Good, 20).await;
        let welding = ProcessName::new("welding").unwrap();
        let bom = BillOfMaterials::new(
            frame,
            Quantity::from(1),
            vec![BomComponent {
                item_id: tube,
                quantity_required: Quantity::from(2),
                process: welding.clone(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();
        let order_id = plant.production.plan(tenant_id, "MO-0003", bom, Quantity::from(6)).await.unwrap();

        let (levels, drawn) = plant
            .production
            .issue_material_fifo(tenant_id, order_id, tube, Quantity::from(12))
            .await
            .unwrap();
        assert_eq!(drawn, vec![(old, Quantity::from(8)), (new, Quantity::from(4))]);
        assert_eq!(levels.wip(&welding), Quantity::from(12));
        assert_eq!(
            plant.production.order(tenant_id, order_id).await.unwrap().issued(tube),
            Quantity::from(12)
        );
        assert_eq!(plant.ledger.batch(tenant_id, new).await.unwrap().levels().wip(&welding), Quantity::from(4));
    }

    #[tokio::test]
    async fn movement_operations_walk_stock_through_every_state() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 100).await;
        let ledger = &plant.ledger;

        let levels = ledger
            .move_to_wip(tenant_id, item_id, cutting(), Quantity::from(40), opening())
            .await
            .unwrap();
        assert_eq!(levels.raw(), Quantity::from(60));
        assert_eq!(levels.wip(&cutting()), Quantity::from(40));

        let levels = ledger
            .receive_from_wip(tenant_id, item_id, cutting(), Quantity::from(30), Quantity::from(2), opening())
            .await
            .unwrap();
        assert_eq!(levels.wip(&cutting()), Quantity::from(8));
        assert_eq!(levels.finished(), Quantity::from(30));
        assert_eq!(levels.scrap(), Quantity::from(2));

        let levels = ledger
            .return_to_raw(tenant_id, item_id, cutting(), Quantity::from(3), opening())
            .await
            .unwrap();
        assert_eq!(levels.raw(), Quantity::from(63));

        let levels = ledger
            .consume_wip(tenant_id, item_id, cutting(), Quantity::from(5), opening())
            .await
            .unwrap();
        assert!(levels.wip_total().is_zero());

        let dispatch = SourceDocument::new(SourceKind::Dispatch, "DC-0001").unwrap();
        let levels = ledger.dispatch(tenant_id, item_id, Quantity::from(25), dispatch).await.unwrap();
        assert_eq!(levels.finished(), Quantity::from(5));
        assert_eq!(levels.total_stock(), Quantity::from(70));

        let err = ledger
            .consume_wip(tenant_id, item_id, cutting(), Quantity::from(1), opening())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientStock { .. }));

        // Opening receipt plus six legs.
        assert_eq!(ledger.movement_history(tenant_id, item_id).await.unwrap().len(), 7);
        let row = plant.settled(tenant_id, item_id).await;
        assert_eq!(row.levels.total_stock(), Quantity::from(70));
    }

    #[tokio::test]
    async fn minimum_stock_drives_the_low_stock_list() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 20).await;
        plant.settled(tenant_id, item_id).await;
        assert!(plant.projection.low_stock(tenant_id).is_empty());

        plant
            .ledger
            .set_minimum_stock(tenant_id, item_id, Some(Quantity::from(25)))
            .await
            .unwrap();
        let mut low = Vec::new();
        for _ in 0..100 {
            low = plant.projection.low_stock(tenant_id);
            if !low.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].item_id, item_id);
    }

    #[tokio::test]
    async fn rejected_and_cancelled_documents_book_nothing() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "STL-10").await;
        let order_id = plant.sent_order(tenant_id, item_id, 50).await;

        let grn_id = plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0001", 20))
            .await
            .unwrap();
        plant.receiving.reject(tenant_id, grn_id, "wrong grade").await.unwrap();
        assert_eq!(plant.receiving.receipt(tenant_id, grn_id).await.unwrap().status(), GrnStatus::Rejected);
        assert!(plant.receiving.post(tenant_id, grn_id).await.is_err());

        plant.purchasing.cancel(tenant_id, order_id, "supplier withdrew").await.unwrap();
        assert_eq!(
            plant.purchasing.order(tenant_id, order_id).await.unwrap().status(),
            PurchaseOrderStatus::Cancelled
        );
        assert!(plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0002", 10))
            .await
            .is_err());
        assert!(plant.ledger.stock_levels(tenant_id, item_id).await.unwrap().is_empty());

        let tube = plant.stocked(tenant_id, "TUB-25", 10).await;
        let bom = BillOfMaterials::new(
            item_id,
            Quantity::from(1),
            vec![BomComponent {
                item_id: tube,
                quantity_required: Quantity::from(1),
                process: ProcessName::new("welding").unwrap(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();
        let mo = plant.production.plan(tenant_id, "MO-0004", bom, Quantity::from(5)).await.unwrap();
        plant.production.cancel(tenant_id, mo, "line down").await.unwrap();
        assert_eq!(plant.production.order(tenant_id, mo).await.unwrap().status(), ProductionStatus::Cancelled);
        assert!(plant
            .production
            .issue_material(tenant_id, mo, tube, Quantity::from(1))
            .await
            .is_err());
        assert_eq!(plant.ledger.stock_levels(tenant_id, tube).await.unwrap().raw(), Quantity::from(10));
    }

    fn job_receipt(job_id: shopfloor_jobwork::JobWorkId, item_id: InventoryItemId, process: ProcessName, grn: &str, qty: u32) -> NewGoodsReceipt {
        NewGoodsReceipt {
            grn_number: grn.to_string(),
            source: ReceiptSource::JobWork { job_id, process },
            item_id,
            quantity: Quantity::from(qty),
            batch_number: None,
            expiry_date: None,
        }
    }

    async fn checked_clean(plant: &Plant, tenant_id: TenantId, items: &[InventoryItemId]) {
        for item_id in items {
            plant.settled(tenant_id, *item_id).await;
        }
        let checker = ConsistencyChecker::new(
            plant.ledger.clone(),
            plant.projection.clone(),
            Arc::new(InMemoryDiscrepancyLog::new()),
        );
        let report = checker.check_tenant(tenant_id).await.unwrap();
        assert!(report.is_consistent(), "{:?}", report.discrepancies);
    }

    #[tokio::test]
    async fn batched_purchase_follows_job_work_and_production() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let steel = plant.item(tenant_id, "STL-10").await;
        let frame = plant.item(tenant_id, "FRM-500").await;
        let order_id = plant.sent_order(tenant_id, steel, 100).await;

        let grn_id = plant
            .receiving
            .record(
                tenant_id,
                NewGoodsReceipt {
                    batch_number: Some(BatchNumber::new("STL-2410-001").unwrap()),
                    ..po_receipt(order_id, steel, "GRN-0001", 100)
                },
            )
            .await
            .unwrap();
        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(100), Quantity::ZERO, None)
            .await
            .unwrap();
        let batch_id = plant.receiving.post(tenant_id, grn_id).await.unwrap().batch_id.unwrap();

        // Plain issue, no batch named: the batch follows the item.
        let (job_id, _) = plant
            .job_work
            .issue(tenant_id, "JW-0010", "Sharma Cutting Works", steel, cutting(), Quantity::from(40))
            .await
            .unwrap();
        let batch = plant.ledger.batch(tenant_id, batch_id).await.unwrap();
        assert_eq!(batch.levels().raw(), Quantity::from(60));
        assert_eq!(batch.levels().wip(&cutting()), Quantity::from(40));

        let grn_id = plant
            .receiving
            .record(tenant_id, job_receipt(job_id, steel, cutting(), "GRN-0102", 40))
            .await
            .unwrap();
        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(38), Quantity::from(2), None)
            .await
            .unwrap();
        plant.receiving.post(tenant_id, grn_id).await.unwrap();
        let batch = plant.ledger.batch(tenant_id, batch_id).await.unwrap();
        assert!(batch.levels().wip_total().is_zero());
        assert_eq!(batch.levels().finished(), Quantity::from(38));
        assert_eq!(batch.levels().scrap(), Quantity::from(2));

        let welding = ProcessName::new("welding").unwrap();
        let bom = BillOfMaterials::new(
            frame,
            Quantity::from(1),
            vec![BomComponent {
                item_id: steel,
                quantity_required: Quantity::from(2),
                process: welding.clone(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();
        let mo = plant.production.plan(tenant_id, "MO-0010", bom, Quantity::from(10)).await.unwrap();
        plant.production.issue_material(tenant_id, mo, steel, Quantity::from(20)).await.unwrap();
        let batch = plant.ledger.batch(tenant_id, batch_id).await.unwrap();
        assert_eq!(batch.levels().raw(), Quantity::from(40));
        assert_eq!(batch.levels().wip(&welding), Quantity::from(20));

        checked_clean(&plant, tenant_id, &[steel, frame]).await;
    }

    #[tokio::test]
    async fn held_batch_blocks_a_plain_issue() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "TUB-25").await;
        let held = plant
            .lot(tenant_id, item_id, "TUB-2410-001", QualityStatus::PendingInspection, 10)
            .await;

        let err = plant
            .ledger
            .move_to_wip(tenant_id, item_id, cutting(), Quantity::from(5), opening())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientStock { .. }));
        assert_eq!(plant.ledger.stock_levels(tenant_id, item_id).await.unwrap().raw(), Quantity::from(10));

        plant.ledger.change_batch_quality(tenant_id, held, QualityStatus::Good).await.unwrap();
        plant
            .ledger
            .move_to_wip(tenant_id, item_id, cutting(), Quantity::from(5), opening())
            .await
            .unwrap();
        assert_eq!(plant.ledger.batch(tenant_id, held).await.unwrap().levels().raw(), Quantity::from(5));
    }

    #[tokio::test]
    async fn sequenced_job_work_hands_wip_to_the_last_process() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.stocked(tenant_id, "BRK-100", 100).await;
        let zinc = ProcessName::new("zinc").unwrap();

        let (job_id, levels) = plant
            .job_work
            .issue_sequence(
                tenant_id,
                "JW-0020",
                "Sharma Cutting Works",
                item_id,
                vec![cutting(), zinc.clone()],
                Quantity::from(40),
            )
            .await
            .unwrap();
        assert_eq!(levels.wip(&cutting()), Quantity::from(40));

        // Only the last process sends goods back.
        let err = plant
            .receiving
            .record(tenant_id, job_receipt(job_id, item_id, cutting(), "GRN-0201", 40))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let levels = plant.job_work.advance(tenant_id, job_id, cutting(), Quantity::from(40)).await.unwrap();
        assert!(levels.wip(&cutting()).is_zero());
        assert_eq!(levels.wip(&zinc), Quantity::from(40));

        let grn_id = plant
            .receiving
            .record(tenant_id, job_receipt(job_id, item_id, zinc.clone(), "GRN-0202", 40))
            .await
            .unwrap();
        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(39), Quantity::from(1), None)
            .await
            .unwrap();
        let posted = plant.receiving.post(tenant_id, grn_id).await.unwrap();
        assert!(posted.levels.wip_total().is_zero());
        assert_eq!(posted.levels.finished(), Quantity::from(39));
        assert_eq!(posted.levels.scrap(), Quantity::from(1));
        assert_eq!(plant.job_work.job(tenant_id, job_id).await.unwrap().status(), JobWorkStatus::Completed);

        checked_clean(&plant, tenant_id, &[item_id]).await;
    }

    #[tokio::test]
    async fn purchase_line_destination_picks_the_bucket() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "BRG-6204").await;
        let order_id = plant
            .purchasing
            .create_order(
                tenant_id,
                "PO-2410-003",
                "Bearing House",
                vec![PurchaseLine {
                    item_id,
                    quantity: Quantity::from(10),
                    destination: ReceiptState::Finished,
                }],
            )
            .await
            .unwrap();
        plant.purchasing.send(tenant_id, order_id).await.unwrap();

        let grn_id = plant
            .receiving
            .record(tenant_id, po_receipt(order_id, item_id, "GRN-0301", 10))
            .await
            .unwrap();
        plant
            .receiving
            .inspect(tenant_id, grn_id, Quantity::from(10), Quantity::ZERO, None)
            .await
            .unwrap();
        let posted = plant.receiving.post(tenant_id, grn_id).await.unwrap();

        assert_eq!(posted.levels.finished(), Quantity::from(10));
        assert!(posted.levels.raw().is_zero());
        assert_eq!(
            plant.receiving.receipt(tenant_id, grn_id).await.unwrap().destination(),
            &ReceiptState::Finished
        );
    }

    #[tokio::test]
    async fn racing_batch_openings_cannot_share_a_number() {
        let plant = Plant::new();
        let tenant_id = TenantId::new();
        let item_id = plant.item(tenant_id, "TUB-25").await;
        let new_batch = || NewBatch {
            batch_number: None,
            origin: opening(),
            quality: QualityStatus::Good,
            expiry_date: None,
        };

        let now = chrono::Utc::now();
        let (_, first) = plant.ledger.decide_new_batch(tenant_id, item_id, new_batch(), None, now).await.unwrap();
        let (_, second) = plant.ledger.decide_new_batch(tenant_id, item_id, new_batch(), None, now).await.unwrap();
        plant.ledger.dispatcher().commit(first.appends).await.unwrap();
        let err = plant.ledger.dispatcher().commit(second.appends).await.unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));

        let batches = plant.ledger.batches_of_item(tenant_id, item_id).await.unwrap();
        assert_eq!(batches.len(), 1);
        let taken = batches[0].batch_number().cloned().unwrap();
        let err = plant
            .ledger
            .open_batch(
                tenant_id,
                item_id,
                NewBatch {
                    batch_number: Some(taken),
                    ..new_batch()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }
}
