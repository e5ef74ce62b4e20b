//! Stock ledger service and its consistency checker.

pub mod consistency;
pub mod service;

pub use consistency::{
    CheckReport, ConsistencyChecker, ConsistencyError, Discrepancy, DiscrepancyLog,
    DiscrepancyRecord, InMemoryDiscrepancyLog, LedgerReplay, PostgresDiscrepancyLog,
};
pub use service::{MovementRecord, NewBatch, NewItem, PlannedPosting, StockLedger};
