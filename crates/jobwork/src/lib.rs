//! Job work: material sent to an outside vendor for a sequence of processes
//! and received back in parts from the last one.

pub mod job;

pub use job::{
    AdvanceJobWorkStage, IssueJobWork, JobWork, JobWorkCommand, JobWorkEvent, JobWorkId,
    JobWorkIssued, JobWorkReceiptRecorded, JobWorkStageAdvanced, JobWorkStatus,
    RecordJobWorkReceipt, RecordUnusedReturn, UnusedMaterialReturned,
};
