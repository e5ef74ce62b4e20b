//! Workflow status machines.
//!
//! A status enum lists every allowed `(from, to)` pair in [`Lifecycle::TRANSITIONS`];
//! anything not in the table is rejected before an event is emitted.

use crate::error::{DomainError, DomainResult};

pub trait Lifecycle: Copy + Eq + core::fmt::Debug + 'static {
    /// Allowed transitions.
    const TRANSITIONS: &'static [(Self, Self)];

    /// Stable lowercase label, used in errors and logs.
    fn label(self) -> &'static str;

    fn can_transition_to(self, next: Self) -> bool {
        Self::TRANSITIONS
            .iter()
            .any(|&(from, to)| from == self && to == next)
    }

    fn transition_to(self, next: Self) -> DomainResult<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self.label(),
                to: next.label(),
            })
        }
    }

    /// No outgoing transitions.
    fn is_terminal(self) -> bool {
        !Self::TRANSITIONS.iter().any(|&(from, _)| from == self)
    }
}
