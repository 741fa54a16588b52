//! Reader state diffing.
//!
//! Turns a `(previous, event)` state pair into at most one card-level
//! transition. The function is pure; whether a remove actually fires is
//! decided by the tracker, which knows if an insert was emitted for the
//! current card presence episode.

use crate::types::StateFlags;

/// Card-level meaning of a reader state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing relevant to card presence changed.
    None,
    /// A card appeared.
    Inserted,
    /// The card went away.
    Removed,
    /// The card was replaced by another between two observations.
    Swapped,
    /// The reader itself is gone.
    Vanished,
}

/// Classify the change from `previous` to `event`.
///
/// A reader whose previous state is `UNAWARE` has no card to remove, so it
/// can only ever produce [`Transition::Inserted`], [`Transition::Vanished`]
/// or [`Transition::None`]. Swap detection needs a known event counter on
/// both sides and a jump of at least two.
pub fn classify(previous: StateFlags, event: StateFlags) -> Transition {
    if event.intersects(StateFlags::UNAVAILABLE | StateFlags::UNKNOWN) {
        return Transition::Vanished;
    }

    let was_present = previous.contains(StateFlags::PRESENT);
    let is_present = event.contains(StateFlags::PRESENT);

    match (was_present, is_present) {
        (false, true) => Transition::Inserted,
        (true, false) => Transition::Removed,
        (true, true) if swapped(previous, event) => Transition::Swapped,
        _ => Transition::None,
    }
}

fn swapped(previous: StateFlags, event: StateFlags) -> bool {
    let (before, after) = (previous.event_count(), event.event_count());
    before != 0 && after.wrapping_sub(before) >= 2
}
