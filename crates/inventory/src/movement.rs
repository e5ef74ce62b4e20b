//! Movement records and the requests that produce them.

use core::fmt;

use serde::{Deserialize, Serialize};

use shopfloor_core::{DomainError, DomainResult, Quantity};

use crate::state::{ProcessName, ReceiptState, StockState};

/// Kind of business document that caused a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PurchaseOrder,
    Grn,
    JobWork,
    Production,
    Dispatch,
    Adjustment,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::PurchaseOrder => "purchase_order",
            SourceKind::Grn => "grn",
            SourceKind::JobWork => "job_work",
            SourceKind::Production => "production",
            SourceKind::Dispatch => "dispatch",
            SourceKind::Adjustment => "adjustment",
        }
    }
}

/// Reference back to the originating document (e.g. `grn` / `GRN-2410-007`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDocument {
    pub kind: SourceKind,
    pub reference: String,
}

impl SourceDocument {
    pub fn new(kind: SourceKind, reference: impl Into<String>) -> DomainResult<Self> {
        let reference = reference.into().trim().to_string();
        if reference.is_empty() {
            return Err(DomainError::validation("source document reference cannot be empty"));
        }
        Ok(Self { kind, reference })
    }
}

impl fmt::Display for SourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.label(), self.reference)
    }
}

/// One immutable ledger entry: `quantity` moved `from` one state `to` another.
///
/// `from: None` is stock entering the ledger (receipt). `to: None` is stock
/// leaving it (dispatch, consumption by production).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub from: Option<StockState>,
    pub to: Option<StockState>,
    pub quantity: Quantity,
    pub source: SourceDocument,
}

/// A movement operation requested by a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MovementRequest {
    /// Raw → WIP (job work dispatch, production issue).
    MoveToWip {
        process: ProcessName,
        quantity: Quantity,
    },
    /// WIP → Finished (`passed`) and WIP → Scrap (`scrap`).
    ReceiveFromWip {
        process: ProcessName,
        passed: Quantity,
        scrap: Quantity,
    },
    /// Outside → a state (purchase receipt, production output).
    ReceiveExternal {
        state: ReceiptState,
        quantity: Quantity,
    },
    /// WIP → Raw (unused material returned by a job-work vendor).
    ReturnToRaw {
        process: ProcessName,
        quantity: Quantity,
    },
    /// WIP → out (component consumed into a production output).
    ConsumeWip {
        process: ProcessName,
        quantity: Quantity,
    },
    /// Finished → out.
    Dispatch { quantity: Quantity },
    /// WIP → WIP (hand-over between sequenced job-work processes).
    TransferWip {
        from: ProcessName,
        to: ProcessName,
        quantity: Quantity,
    },
}

impl MovementRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            MovementRequest::MoveToWip { .. } => "move_to_wip",
            MovementRequest::ReceiveFromWip { .. } => "receive_from_wip",
            MovementRequest::ReceiveExternal { .. } => "receive_external",
            MovementRequest::ReturnToRaw { .. } => "return_to_raw",
            MovementRequest::ConsumeWip { .. } => "consume_wip",
            MovementRequest::Dispatch { .. } => "dispatch",
            MovementRequest::TransferWip { .. } => "transfer_wip",
        }
    }

    /// The single-leg request that books `movement` again, e.g. a batch's
    /// share of an item booking. `None` for receipts, which have no source
    /// bucket to share.
    pub fn for_leg(movement: &StockMovement) -> Option<Self> {
        let quantity = movement.quantity;
        let request = match (movement.from.as_ref()?, movement.to.as_ref()) {
            (StockState::Raw, Some(StockState::Wip(process))) => MovementRequest::MoveToWip {
                process: process.clone(),
                quantity,
            },
            (StockState::Wip(process), Some(StockState::Finished)) => MovementRequest::ReceiveFromWip {
                process: process.clone(),
                passed: quantity,
                scrap: Quantity::ZERO,
            },
            (StockState::Wip(process), Some(StockState::Scrap)) => MovementRequest::ReceiveFromWip {
                process: process.clone(),
                passed: Quantity::ZERO,
                scrap: quantity,
            },
            (StockState::Wip(process), Some(StockState::Raw)) => MovementRequest::ReturnToRaw {
                process: process.clone(),
                quantity,
            },
            (StockState::Wip(process), None) => MovementRequest::ConsumeWip {
                process: process.clone(),
                quantity,
            },
            (StockState::Wip(from), Some(StockState::Wip(to))) => MovementRequest::TransferWip {
                from: from.clone(),
                to: to.clone(),
                quantity,
            },
            (StockState::Finished, None) => MovementRequest::Dispatch { quantity },
            _ => return None,
        };
        Some(request)
    }

    /// Legs this request books, without checking availability.
    ///
    /// Zero-quantity legs are left out. A request with no legs at all is only
    /// valid for `ReceiveExternal`.
    pub fn legs(&self, source: &SourceDocument) -> DomainResult<Vec<StockMovement>> {
        let leg = |from: Option<StockState>, to: Option<StockState>, quantity: Quantity| {
            StockMovement {
                from,
                to,
                quantity,
                source: source.clone(),
            }
        };

        let legs: Vec<StockMovement> = match self {
            MovementRequest::MoveToWip { process, quantity } => {
                vec![leg(Some(StockState::Raw), Some(StockState::wip(process)), *quantity)]
            }
            MovementRequest::ReceiveFromWip {
                process,
                passed,
                scrap,
            } => vec![
                leg(Some(StockState::wip(process)), Some(StockState::Finished), *passed),
                leg(Some(StockState::wip(process)), Some(StockState::Scrap), *scrap),
            ],
            MovementRequest::ReceiveExternal { state, quantity } => {
                vec![leg(None, Some(state.clone().into()), *quantity)]
            }
            MovementRequest::ReturnToRaw { process, quantity } => {
                vec![leg(Some(StockState::wip(process)), Some(StockState::Raw), *quantity)]
            }
            MovementRequest::ConsumeWip { process, quantity } => {
                vec![leg(Some(StockState::wip(process)), None, *quantity)]
            }
            MovementRequest::Dispatch { quantity } => {
                vec![leg(Some(StockState::Finished), None, *quantity)]
            }
            MovementRequest::TransferWip { from, to, quantity } => {
                if from == to {
                    return Err(DomainError::validation(format!(
                        "cannot transfer WIP from {from} to itself"
                    )));
                }
                vec![leg(Some(StockState::wip(from)), Some(StockState::wip(to)), *quantity)]
            }
        };

        let legs: Vec<StockMovement> = legs.into_iter().filter(|l| !l.quantity.is_zero()).collect();

        if legs.is_empty() && !matches!(self, MovementRequest::ReceiveExternal { .. }) {
            return Err(DomainError::validation(format!(
                "{} requires a positive quantity",
                self.operation()
            )));
        }

        Ok(legs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grn() -> SourceDocument {
        SourceDocument::new(SourceKind::Grn, "GRN-0001").unwrap()
    }

    fn cutting() -> ProcessName {
        ProcessName::new("cutting").unwrap()
    }

    #[test]
    fn receive_from_wip_books_passed_and_scrap_legs() {
        let req = MovementRequest::ReceiveFromWip {
            process: cutting(),
            passed: Quantity::from(38),
            scrap: Quantity::from(2),
        };
        let legs = req.legs(&grn()).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].to, Some(StockState::Finished));
        assert_eq!(legs[1].to, Some(StockState::Scrap));
        assert!(legs.iter().all(|l| l.from == Some(StockState::wip(&cutting()))));
    }

    #[test]
    fn zero_scrap_leg_is_omitted() {
        let req = MovementRequest::ReceiveFromWip {
            process: cutting(),
            passed: Quantity::from(5),
            scrap: Quantity::ZERO,
        };
        assert_eq!(req.legs(&grn()).unwrap().len(), 1);
    }

    #[test]
    fn zero_external_receipt_books_nothing() {
        let req = MovementRequest::ReceiveExternal {
            state: ReceiptState::Raw,
            quantity: Quantity::ZERO,
        };
        assert!(req.legs(&grn()).unwrap().is_empty());
    }

    #[test]
    fn zero_internal_move_is_invalid() {
        let req = MovementRequest::MoveToWip {
            process: cutting(),
            quantity: Quantity::ZERO,
        };
        assert!(matches!(req.legs(&grn()), Err(DomainError::Validation(_))));
    }

    #[test]
    fn transfer_moves_wip_between_processes() {
        let bending = ProcessName::new("bending").unwrap();
        let req = MovementRequest::TransferWip {
            from: cutting(),
            to: bending.clone(),
            quantity: Quantity::from(12),
        };
        let legs = req.legs(&grn()).unwrap();
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].from, Some(StockState::wip(&cutting())));
        assert_eq!(legs[0].to, Some(StockState::wip(&bending)));

        let same = MovementRequest::TransferWip {
            from: cutting(),
            to: cutting(),
            quantity: Quantity::from(1),
        };
        assert!(matches!(same.legs(&grn()), Err(DomainError::Validation(_))));
    }

    #[test]
    fn every_withdrawal_leg_maps_back_to_a_request() {
        let requests = [
            MovementRequest::MoveToWip {
                process: cutting(),
                quantity: Quantity::from(4),
            },
            MovementRequest::ReceiveFromWip {
                process: cutting(),
                passed: Quantity::from(3),
                scrap: Quantity::from(1),
            },
            MovementRequest::ReturnToRaw {
                process: cutting(),
                quantity: Quantity::from(2),
            },
            MovementRequest::ConsumeWip {
                process: cutting(),
                quantity: Quantity::from(2),
            },
            MovementRequest::Dispatch {
                quantity: Quantity::from(5),
            },
        ];
        for request in requests {
            for leg in request.legs(&grn()).unwrap() {
                let single = MovementRequest::for_leg(&leg).unwrap();
                assert_eq!(single.legs(&grn()).unwrap(), vec![leg]);
            }
        }

        let receipt = MovementRequest::ReceiveExternal {
            state: ReceiptState::Raw,
            quantity: Quantity::from(5),
        };
        let leg = receipt.legs(&grn()).unwrap().remove(0);
        assert_eq!(MovementRequest::for_leg(&leg), None);
    }

    #[test]
    fn empty_source_reference_is_rejected() {
        assert!(SourceDocument::new(SourceKind::JobWork, "   ").is_err());
        assert_eq!(grn().to_string(), "grn/GRN-0001");
    }
}
