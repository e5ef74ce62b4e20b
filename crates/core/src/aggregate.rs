//! Aggregate contract for event-sourced ledger and workflow models.

use crate::error::{DomainError, DomainResult};

/// Identity + stream revision of an aggregate.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events folded into this instance.
    ///
    /// Matches the stream revision in the event store, so it doubles as the
    /// expected version for the next append.
    fn version(&self) -> u64;
}

/// Expected stream revision for an append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the current revision.
    Any,
    /// The stream must be exactly at this revision.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stream revision check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Decide/evolve split of an event-sourced aggregate.
///
/// - `handle(&self, cmd)` validates a command against current state and returns
///   the events it would produce. It never mutates, so a rejected command leaves
///   the aggregate exactly as it was.
/// - `apply(&mut self, event)` folds one event into state and bumps `version()`.
///
/// Neither method performs IO.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_only_matches_same_revision() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert!(ExpectedVersion::Any.matches(42));
    }

    #[test]
    fn failed_check_is_a_conflict() {
        let err = ExpectedVersion::Exact(1).check(2).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
