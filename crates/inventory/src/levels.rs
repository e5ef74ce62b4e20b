use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use shopfloor_core::{DomainError, DomainResult, Quantity};

use crate::movement::{MovementRequest, SourceDocument, StockMovement};
use crate::state::{ProcessName, StockState};

/// Quantities per state for one item or batch.
///
/// Built only by folding [`StockMovement`]s. Totals are computed, never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    raw: Quantity,
    #[serde(default)]
    wip: BTreeMap<ProcessName, Quantity>,
    finished: Quantity,
    scrap: Quantity,
}

impl StockLevels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> Quantity {
        self.raw
    }

    pub fn finished(&self) -> Quantity {
        self.finished
    }

    pub fn scrap(&self) -> Quantity {
        self.scrap
    }

    pub fn wip(&self, process: &ProcessName) -> Quantity {
        self.wip.get(process).copied().unwrap_or(Quantity::ZERO)
    }

    /// Non-empty WIP buckets, ordered by process name.
    pub fn wip_buckets(&self) -> &BTreeMap<ProcessName, Quantity> {
        &self.wip
    }

    pub fn wip_total(&self) -> Quantity {
        self.wip.values().sum()
    }

    /// `raw + Σ wip + finished + scrap`.
    pub fn total_stock(&self) -> Quantity {
        self.raw + self.wip_total() + self.finished + self.scrap
    }

    /// Stock that can be issued or sold right now (`raw + finished`).
    pub fn available(&self) -> Quantity {
        self.raw + self.finished
    }

    pub fn get(&self, state: &StockState) -> Quantity {
        match state {
            StockState::Raw => self.raw,
            StockState::Wip(p) => self.wip(p),
            StockState::Finished => self.finished,
            StockState::Scrap => self.scrap,
        }
    }

    /// Every state holding stock, with its quantity.
    pub fn states(&self) -> Vec<(StockState, Quantity)> {
        let mut out = Vec::with_capacity(3 + self.wip.len());
        if !self.raw.is_zero() {
            out.push((StockState::Raw, self.raw));
        }
        for (process, qty) in &self.wip {
            out.push((StockState::Wip(process.clone()), *qty));
        }
        if !self.finished.is_zero() {
            out.push((StockState::Finished, self.finished));
        }
        if !self.scrap.is_zero() {
            out.push((StockState::Scrap, self.scrap));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.total_stock().is_zero()
    }

    /// Validate `request` against current quantities and return the movements to record.
    ///
    /// Withdrawals are summed per source state before checking, so a WIP
    /// receipt needs `passed + scrap` in the bucket, not each leg on its own.
    pub fn plan(
        &self,
        request: &MovementRequest,
        source: &SourceDocument,
    ) -> DomainResult<Vec<StockMovement>> {
        let legs = request.legs(source)?;

        let mut withdrawals: BTreeMap<&StockState, Quantity> = BTreeMap::new();
        for leg in &legs {
            if let Some(from) = &leg.from {
                *withdrawals.entry(from).or_default() += leg.quantity;
            }
        }

        for (state, requested) in withdrawals {
            let available = self.get(state);
            if requested > available {
                return Err(DomainError::insufficient_stock(
                    state.to_string(),
                    available.value(),
                    requested.value(),
                ));
            }
        }

        Ok(legs)
    }

    /// Fold one recorded movement, rejecting a withdrawal larger than its bucket.
    ///
    /// Used when replaying the ledger to audit it. Levels are unchanged on error.
    pub fn try_apply(&mut self, movement: &StockMovement) -> DomainResult<()> {
        if let Some(from) = &movement.from {
            let available = self.get(from);
            if movement.quantity > available {
                return Err(DomainError::insufficient_stock(
                    from.to_string(),
                    available.value(),
                    movement.quantity.value(),
                ));
            }
        }
        self.apply(movement);
        Ok(())
    }

    /// Fold one recorded movement.
    ///
    /// Recorded movements were validated by [`Self::plan`]. Withdrawals clamp
    /// at zero here; audits replay with [`Self::try_apply`] instead.
    pub fn apply(&mut self, movement: &StockMovement) {
        if let Some(from) = &movement.from {
            let current = self.get(from);
            self.set(from, current.saturating_sub(movement.quantity));
        }
        if let Some(to) = &movement.to {
            let current = self.get(to);
            self.set(to, current + movement.quantity);
        }
    }

    fn set(&mut self, state: &StockState, quantity: Quantity) {
        match state {
            StockState::Raw => self.raw = quantity,
            StockState::Finished => self.finished = quantity,
            StockState::Scrap => self.scrap = quantity,
            StockState::Wip(p) => {
                if quantity.is_zero() {
                    self.wip.remove(p);
                } else {
                    self.wip.insert(p.clone(), quantity);
                }
            }
        }
    }
}

impl<'a> FromIterator<&'a StockMovement> for StockLevels {
    fn from_iter<I: IntoIterator<Item = &'a StockMovement>>(iter: I) -> Self {
        let mut levels = StockLevels::new();
        for m in iter {
            levels.apply(m);
        }
        levels
    }
}
