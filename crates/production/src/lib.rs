//! Production: bills of materials and production orders that turn component
//! stock into finished output.

pub mod bom;
pub mod order;

pub use bom::{BillOfMaterials, BomComponent, MaterialRequirement, Shortage};
pub use order::{
    CancelProduction, CompleteProduction, ConsumeMaterial, IssueMaterial, MaterialConsumed,
    MaterialIssued, OutputRecorded, PlanProduction, ProductionCancelled, ProductionCompleted,
    ProductionOrder, ProductionOrderCommand, ProductionOrderEvent, ProductionOrderId,
    ProductionPlanned, ProductionStatus, RecordOutput,
};
