use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    Aggregate, AggregateRoot, Completion, DomainError, DomainResult, Lifecycle, Quantity,
    TenantId, aggregate_id_newtype,
};
use shopfloor_events::Event;
use shopfloor_inventory::{
    InventoryItemId, MovementRequest, ProcessName, ReceiptState, SourceDocument, SourceKind,
    StockPosting,
};

use crate::bom::{BillOfMaterials, MaterialRequirement};

aggregate_id_newtype!(
    /// Production order identifier.
    ProductionOrderId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductionStatus {
    Planned,
    InProgress,
    Completed,
    Cancelled,
}

impl Lifecycle for ProductionStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (ProductionStatus::Planned, ProductionStatus::InProgress),
        (ProductionStatus::Planned, ProductionStatus::Cancelled),
        (ProductionStatus::InProgress, ProductionStatus::Completed),
    ];

    fn label(self) -> &'static str {
        match self {
            ProductionStatus::Planned => "planned",
            ProductionStatus::InProgress => "in_progress",
            ProductionStatus::Completed => "completed",
            ProductionStatus::Cancelled => "cancelled",
        }
    }
}

/// Aggregate root: ProductionOrder.
///
/// Holds a snapshot of the BOM taken at planning time. Damaged output is
/// tracked on the order only and never enters stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionOrder {
    id: ProductionOrderId,
    tenant_id: Option<TenantId>,
    order_number: String,
    bom: Option<BillOfMaterials>,
    output: Completion,
    damaged: Quantity,
    issued: BTreeMap<InventoryItemId, Quantity>,
    consumed: BTreeMap<InventoryItemId, Quantity>,
    status: ProductionStatus,
    version: u64,
    created: bool,
}

impl ProductionOrder {
    pub const AGGREGATE_TYPE: &'static str = "production.order";

    pub fn empty(id: ProductionOrderId) -> Self {
        Self {
            id,
            tenant_id: None,
            order_number: String::new(),
            bom: None,
            output: Completion::new(Quantity::ZERO),
            damaged: Quantity::ZERO,
            issued: BTreeMap::new(),
            consumed: BTreeMap::new(),
            status: ProductionStatus::Planned,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ProductionOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn is_planned(&self) -> bool {
        self.created
    }

    pub fn order_number(&self) -> &str {
        &self.order_number
    }

    pub fn bom(&self) -> Option<&BillOfMaterials> {
        self.bom.as_ref()
    }

    pub fn status(&self) -> ProductionStatus {
        self.status
    }

    pub fn planned_quantity(&self) -> Quantity {
        self.output.expected()
    }

    pub fn produced(&self) -> Quantity {
        self.output.received()
    }

    pub fn damaged(&self) -> Quantity {
        self.damaged
    }

    /// Produced over planned.
    pub fn completion(&self) -> Completion {
        self.output
    }

    pub fn issued(&self, item_id: InventoryItemId) -> Quantity {
        self.issued.get(&item_id).copied().unwrap_or_default()
    }

    pub fn consumed(&self, item_id: InventoryItemId) -> Quantity {
        self.consumed.get(&item_id).copied().unwrap_or_default()
    }

    /// Issued but not yet consumed.
    pub fn in_process(&self, item_id: InventoryItemId) -> Quantity {
        self.issued(item_id).saturating_sub(self.consumed(item_id))
    }

    /// Component requirements for the planned quantity.
    pub fn requirements(&self) -> DomainResult<Vec<MaterialRequirement>> {
        match &self.bom {
            Some(bom) => bom.requirements(self.planned_quantity()),
            None => Ok(Vec::new()),
        }
    }

    fn component_process(&self, item_id: InventoryItemId) -> DomainResult<ProcessName> {
        self.bom
            .as_ref()
            .and_then(|bom| bom.component(item_id))
            .map(|c| c.process.clone())
            .ok_or_else(|| {
                DomainError::validation(format!("item {item_id} is not a component of this order"))
            })
    }
}

impl AggregateRoot for ProductionOrder {
    type Id = ProductionOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProduction {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub order_number: String,
    pub bom: BillOfMaterials,
    pub planned_quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: IssueMaterial. Moves a component from raw into its process WIP;
/// the first issue starts the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMaterial {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeMaterial {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub item_id: InventoryItemId,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutput {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub good: Quantity,
    pub damaged: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteProduction {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelProduction {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductionOrderCommand {
    Plan(PlanProduction),
    IssueMaterial(IssueMaterial),
    ConsumeMaterial(ConsumeMaterial),
    RecordOutput(RecordOutput),
    Complete(CompleteProduction),
    Cancel(CancelProduction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionPlanned {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub order_number: String,
    pub bom: BillOfMaterials,
    pub planned_quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialIssued {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub order_number: String,
    pub item_id: InventoryItemId,
    pub process: ProcessName,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialConsumed {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub order_number: String,
    pub item_id: InventoryItemId,
    pub process: ProcessName,
    pub quantity: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecorded {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub order_number: String,
    pub output_item: InventoryItemId,
    pub good: Quantity,
    pub damaged: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionCompleted {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub produced: Quantity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionCancelled {
    pub tenant_id: TenantId,
    pub order_id: ProductionOrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductionOrderEvent {
    ProductionPlanned(ProductionPlanned),
    MaterialIssued(MaterialIssued),
    MaterialConsumed(MaterialConsumed),
    OutputRecorded(OutputRecorded),
    ProductionCompleted(ProductionCompleted),
    ProductionCancelled(ProductionCancelled),
}

impl ProductionOrderEvent {
    /// Ledger movement booked with this event, if any.
    pub fn stock_posting(&self) -> Option<StockPosting> {
        let source = |reference: &str| SourceDocument {
            kind: SourceKind::Production,
            reference: reference.to_string(),
        };

        match self {
            ProductionOrderEvent::MaterialIssued(e) => Some(StockPosting::new(
                e.item_id,
                MovementRequest::MoveToWip {
                    process: e.process.clone(),
                    quantity: e.quantity,
                },
                source(&e.order_number),
            )),
            ProductionOrderEvent::MaterialConsumed(e) => Some(StockPosting::new(
                e.item_id,
                MovementRequest::ConsumeWip {
                    process: e.process.clone(),
                    quantity: e.quantity,
                },
                source(&e.order_number),
            )),
            ProductionOrderEvent::OutputRecorded(e) if !e.good.is_zero() => {
                Some(StockPosting::new(
                    e.output_item,
                    MovementRequest::ReceiveExternal {
                        state: ReceiptState::Finished,
                        quantity: e.good,
                    },
                    source(&e.order_number),
                ))
            }
            _ => None,
        }
    }
}

impl Event for ProductionOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProductionOrderEvent::ProductionPlanned(_) => "production.order.planned",
            ProductionOrderEvent::MaterialIssued(_) => "production.order.material_issued",
            ProductionOrderEvent::MaterialConsumed(_) => "production.order.material_consumed",
            ProductionOrderEvent::OutputRecorded(_) => "production.order.output_recorded",
            ProductionOrderEvent::ProductionCompleted(_) => "production.order.completed",
            ProductionOrderEvent::ProductionCancelled(_) => "production.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductionOrderEvent::ProductionPlanned(e) => e.occurred_at,
            ProductionOrderEvent::MaterialIssued(e) => e.occurred_at,
            ProductionOrderEvent::MaterialConsumed(e) => e.occurred_at,
            ProductionOrderEvent::OutputRecorded(e) => e.occurred_at,
            ProductionOrderEvent::ProductionCompleted(e) => e.occurred_at,
            ProductionOrderEvent::ProductionCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for ProductionOrder {
    type Command = ProductionOrderCommand;
    type Event = ProductionOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ProductionOrderEvent::ProductionPlanned(e) => {
                self.id = e.order_id;
                self.tenant_id = Some(e.tenant_id);
                self.order_number = e.order_number.clone();
                self.bom = Some(e.bom.clone());
                self.output = Completion::new(e.planned_quantity);
                self.status = ProductionStatus::Planned;
                self.created = true;
            }
            ProductionOrderEvent::MaterialIssued(e) => {
                *self.issued.entry(e.item_id).or_default() += e.quantity;
                self.status = ProductionStatus::InProgress;
            }
            ProductionOrderEvent::MaterialConsumed(e) => {
                *self.consumed.entry(e.item_id).or_default() += e.quantity;
            }
            ProductionOrderEvent::OutputRecorded(e) => {
                self.output.record(e.good);
                self.damaged += e.damaged;
            }
            ProductionOrderEvent::ProductionCompleted(_) => {
                self.status = ProductionStatus::Completed;
            }
            ProductionOrderEvent::ProductionCancelled(_) => {
                self.status = ProductionStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ProductionOrderCommand::Plan(cmd) => self.handle_plan(cmd),
            ProductionOrderCommand::IssueMaterial(cmd) => self.handle_issue(cmd),
            ProductionOrderCommand::ConsumeMaterial(cmd) => self.handle_consume(cmd),
            ProductionOrderCommand::RecordOutput(cmd) => self.handle_output(cmd),
            ProductionOrderCommand::Complete(cmd) => self.handle_complete(cmd),
            ProductionOrderCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl ProductionOrder {
    fn ensure_existing(&self, tenant_id: TenantId, order_id: ProductionOrderId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_in_progress(&self) -> DomainResult<()> {
        if self.status != ProductionStatus::InProgress {
            return Err(DomainError::invariant(format!(
                "production order is {}, not in progress",
                self.status.label()
            )));
        }
        Ok(())
    }

    fn handle_plan(&self, cmd: &PlanProduction) -> DomainResult<Vec<ProductionOrderEvent>> {
        if self.created {
            return Err(DomainError::conflict("production order already exists"));
        }
        if cmd.order_number.trim().is_empty() {
            return Err(DomainError::validation("order number cannot be empty"));
        }
        if cmd.planned_quantity.is_zero() {
            return Err(DomainError::validation("planned quantity must be positive"));
        }

        Ok(vec![ProductionOrderEvent::ProductionPlanned(
            ProductionPlanned {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                order_number: cmd.order_number.trim().to_string(),
                bom: cmd.bom.clone(),
                planned_quantity: cmd.planned_quantity,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_issue(&self, cmd: &IssueMaterial) -> DomainResult<Vec<ProductionOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;

        if self.status == ProductionStatus::Planned {
            self.status.transition_to(ProductionStatus::InProgress)?;
        } else {
            self.ensure_in_progress()?;
        }
        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("issued quantity must be positive"));
        }
        let process = self.component_process(cmd.item_id)?;

        Ok(vec![ProductionOrderEvent::MaterialIssued(MaterialIssued {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            order_number: self.order_number.clone(),
            item_id: cmd.item_id,
            process,
            quantity: cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_consume(&self, cmd: &ConsumeMaterial) -> DomainResult<Vec<ProductionOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.ensure_in_progress()?;

        if cmd.quantity.is_zero() {
            return Err(DomainError::validation("consumed quantity must be positive"));
        }
        let process = self.component_process(cmd.item_id)?;

        let in_process = self.in_process(cmd.item_id);
        if cmd.quantity > in_process {
            return Err(DomainError::validation(format!(
                "cannot consume {} of {}: only {} issued and unconsumed",
                cmd.quantity, cmd.item_id, in_process
            )));
        }

        Ok(vec![ProductionOrderEvent::MaterialConsumed(
            MaterialConsumed {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                order_number: self.order_number.clone(),
                item_id: cmd.item_id,
                process,
                quantity: cmd.quantity,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_output(&self, cmd: &RecordOutput) -> DomainResult<Vec<ProductionOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.ensure_in_progress()?;

        if (cmd.good + cmd.damaged).is_zero() {
            return Err(DomainError::validation("output quantity must be positive"));
        }
        self.output.ensure_accepts(cmd.good)?;

        let output_item = self
            .bom
            .as_ref()
            .map(BillOfMaterials::output_item)
            .ok_or_else(|| DomainError::invariant("planned order without BOM"))?;

        Ok(vec![ProductionOrderEvent::OutputRecorded(OutputRecorded {
            tenant_id: cmd.tenant_id,
            order_id: cmd.order_id,
            order_number: self.order_number.clone(),
            output_item,
            good: cmd.good,
            damaged: cmd.damaged,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteProduction) -> DomainResult<Vec<ProductionOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.status.transition_to(ProductionStatus::Completed)?;

        Ok(vec![ProductionOrderEvent::ProductionCompleted(
            ProductionCompleted {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                produced: self.produced(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_cancel(&self, cmd: &CancelProduction) -> DomainResult<Vec<ProductionOrderEvent>> {
        self.ensure_existing(cmd.tenant_id, cmd.order_id)?;
        self.status.transition_to(ProductionStatus::Cancelled)?;

        Ok(vec![ProductionOrderEvent::ProductionCancelled(
            ProductionCancelled {
                tenant_id: cmd.tenant_id,
                order_id: cmd.order_id,
                reason: cmd.reason.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bom::BomComponent;
    use shopfloor_core::Decimal;
    use shopfloor_events::execute;

    struct Fixture {
        tenant_id: TenantId,
        order_id: ProductionOrderId,
        frame: InventoryItemId,
        sheet: InventoryItemId,
    }

    fn planned_order() -> (ProductionOrder, Fixture) {
        let fx = Fixture {
            tenant_id: TenantId::new(),
            order_id: ProductionOrderId::generate(),
            frame: InventoryItemId::generate(),
            sheet: InventoryItemId::generate(),
        };
        let bom = BillOfMaterials::new(
            fx.frame,
            Quantity::from(1),
            vec![BomComponent {
                item_id: fx.sheet,
                quantity_required: Quantity::from(2),
                process: ProcessName::new("welding").unwrap(),
                scrap_percent: Decimal::ZERO,
            }],
        )
        .unwrap();

        let mut order = ProductionOrder::empty(fx.order_id);
        execute(
            &mut order,
            &ProductionOrderCommand::Plan(PlanProduction {
                tenant_id: fx.tenant_id,
                order_id: fx.order_id,
                order_number: "PRD-2410-002".to_string(),
                bom,
                planned_quantity: Quantity::from(10),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        (order, fx)
    }

    fn issue(fx: &Fixture, item_id: InventoryItemId, qty: u32) -> ProductionOrderCommand {
        ProductionOrderCommand::IssueMaterial(IssueMaterial {
            tenant_id: fx.tenant_id,
            order_id: fx.order_id,
            item_id,
            quantity: Quantity::from(qty),
            occurred_at: Utc::now(),
        })
    }

    fn consume(fx: &Fixture, qty: u32) -> ProductionOrderCommand {
        ProductionOrderCommand::ConsumeMaterial(ConsumeMaterial {
            tenant_id: fx.tenant_id,
            order_id: fx.order_id,
            item_id: fx.sheet,
            quantity: Quantity::from(qty),
            occurred_at: Utc::now(),
        })
    }

    fn output(fx: &Fixture, good: u32, damaged: u32) -> ProductionOrderCommand {
        ProductionOrderCommand::RecordOutput(RecordOutput {
            tenant_id: fx.tenant_id,
            order_id: fx.order_id,
            good: Quantity::from(good),
            damaged: Quantity::from(damaged),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn first_issue_starts_the_order_and_posts_to_component_wip() {
        let (mut order, fx) = planned_order();
        assert_eq!(order.requirements().unwrap()[0].required, Quantity::from(20));

        let events = execute(&mut order, &issue(&fx, fx.sheet, 20)).unwrap();
        assert_eq!(order.status(), ProductionStatus::InProgress);
        assert_eq!(order.issued(fx.sheet), Quantity::from(20));

        let posting = events[0].stock_posting().unwrap();
        assert_eq!(posting.item_id, fx.sheet);
        assert_eq!(
            posting.request,
            MovementRequest::MoveToWip {
                process: ProcessName::new("welding").unwrap(),
                quantity: Quantity::from(20),
            }
        );
        assert_eq!(posting.source.kind, SourceKind::Production);
    }

    #[test]
    fn issuing_a_non_component_is_rejected() {
        let (order, fx) = planned_order();
        let err = order.handle(&issue(&fx, fx.frame, 1)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn cannot_consume_more_than_issued() {
        let (mut order, fx) = planned_order();
        execute(&mut order, &issue(&fx, fx.sheet, 5)).unwrap();
        execute(&mut order, &consume(&fx, 4)).unwrap();
        assert_eq!(order.in_process(fx.sheet), Quantity::from(1));

        assert!(matches!(
            order.handle(&consume(&fx, 2)),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn damaged_output_is_not_posted_to_stock() {
        let (mut order, fx) = planned_order();
        execute(&mut order, &issue(&fx, fx.sheet, 20)).unwrap();

        let events = execute(&mut order, &output(&fx, 6, 1)).unwrap();
        match events[0].stock_posting().map(|p| p.request) {
            Some(MovementRequest::ReceiveExternal { state, quantity }) => {
                assert_eq!(state, ReceiptState::Finished);
                assert_eq!(quantity, Quantity::from(6));
            }
            other => panic!("Expected finished receipt, got {other:?}"),
        }

        let events = execute(&mut order, &output(&fx, 0, 2)).unwrap();
        assert!(events[0].stock_posting().is_none());
        assert_eq!(order.produced(), Quantity::from(6));
        assert_eq!(order.damaged(), Quantity::from(3));
        assert_eq!(order.completion().percent(), Decimal::from(60));
    }

    #[test]
    fn over_production_is_rejected() {
        let (mut order, fx) = planned_order();
        execute(&mut order, &issue(&fx, fx.sheet, 20)).unwrap();
        execute(&mut order, &output(&fx, 9, 0)).unwrap();

        assert!(matches!(
            order.handle(&output(&fx, 2, 0)),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn planned_order_cannot_be_completed_but_can_be_cancelled() {
        let (mut order, fx) = planned_order();

        let err = order
            .handle(&ProductionOrderCommand::Complete(CompleteProduction {
                tenant_id: fx.tenant_id,
                order_id: fx.order_id,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "planned",
                to: "completed"
            }
        );

        execute(
            &mut order,
            &ProductionOrderCommand::Cancel(CancelProduction {
                tenant_id: fx.tenant_id,
                order_id: fx.order_id,
                reason: "customer withdrew".to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(order.status(), ProductionStatus::Cancelled);
        assert!(order.handle(&issue(&fx, fx.sheet, 1)).is_err());
    }

    #[test]
    fn in_progress_order_cannot_be_cancelled() {
        let (mut order, fx) = planned_order();
        execute(&mut order, &issue(&fx, fx.sheet, 1)).unwrap();

        let err = order
            .handle(&ProductionOrderCommand::Cancel(CancelProduction {
                tenant_id: fx.tenant_id,
                order_id: fx.order_id,
                reason: "late".to_string(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }
}
