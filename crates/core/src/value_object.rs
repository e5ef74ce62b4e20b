//! Value objects: compared by value, never by identity.

/// Marker for immutable domain values such as [`crate::Quantity`] or a process name.
///
/// To "change" a value object, build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
