//! Domain building blocks shared by every ledger and workflow crate.
//!
//! Pure domain code only: identifiers, the aggregate contract, the error model,
//! non-negative quantities, receipt progress and workflow lifecycles.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod progress;
pub mod quantity;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId, UserId};
pub use lifecycle::Lifecycle;
pub use progress::Completion;
pub use quantity::Quantity;
pub use value_object::ValueObject;

pub use rust_decimal::Decimal;
