use chrono::{DateTime, Utc};

/// A fact recorded in a stream.
///
/// Events are immutable once appended. `event_type` + `version` identify the
/// payload schema so old streams stay readable.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable dotted name, e.g. `"inventory.item.stock_moved"`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Business time of the fact (not the append time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
