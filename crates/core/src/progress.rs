//! Receipt progress against an expected total.
//!
//! Documents that are fulfilled in parts (purchase order lines, job work,
//! production runs) keep the quantities and compute completion on demand.
//! There is no stored "percent complete" that could drift from the quantities.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::quantity::Quantity;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    expected: Quantity,
    received: Quantity,
}

impl Completion {
    pub fn new(expected: Quantity) -> Self {
        Self {
            expected,
            received: Quantity::ZERO,
        }
    }

    pub fn expected(&self) -> Quantity {
        self.expected
    }

    pub fn received(&self) -> Quantity {
        self.received
    }

    pub fn outstanding(&self) -> Quantity {
        self.expected.saturating_sub(self.received)
    }

    /// `received / expected`. An empty expectation counts as fully received.
    pub fn ratio(&self) -> Decimal {
        if self.expected.is_zero() {
            return Decimal::ONE;
        }
        self.received.value() / self.expected.value()
    }

    /// Ratio as a percentage rounded to two decimals.
    pub fn percent(&self) -> Decimal {
        (self.ratio() * Decimal::ONE_HUNDRED).round_dp(2)
    }

    pub fn is_started(&self) -> bool {
        !self.received.is_zero()
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    /// Fails if `quantity` exceeds what is still outstanding.
    pub fn ensure_accepts(&self, quantity: Quantity) -> DomainResult<()> {
        if quantity > self.outstanding() {
            return Err(DomainError::validation(format!(
                "receipt of {quantity} exceeds outstanding quantity {}",
                self.outstanding()
            )));
        }
        Ok(())
    }

    /// Record a receipt (no check; callers validate with [`Self::ensure_accepts`] first).
    pub fn record(&mut self, quantity: Quantity) {
        self.received += quantity;
    }
}
