use shopfloor_core::Aggregate;

/// Decide and immediately fold the resulting events into `aggregate`.
///
/// Storage-free counterpart of the dispatcher pipeline, for tests and in-process
/// replays. On error nothing is applied.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: Aggregate,
{
    let events = aggregate.handle(command)?;
    for ev in &events {
        aggregate.apply(ev);
    }
    Ok(events)
}
