use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::{CapacityPolicy, DayRange, StoryState};

/// Travellers committed on a single date: the sum of party sizes over
/// capacity-holding bookings whose range covers `date`.
pub fn occupancy_on(state: &StoryState, date: NaiveDate, policy: CapacityPolicy) -> u32 {
    let day = DayRange::new(date, date);
    state
        .overlapping(&day)
        .filter(|b| b.holds_capacity(policy))
        .map(|b| b.party_size)
        .sum()
}

/// Travellers committed against the story's whole shared pool: scheduled
/// stories keep one pool for the entire departure window, so every
/// capacity-holding booking counts once regardless of its exact dates.
pub fn pool_occupancy(state: &StoryState, policy: CapacityPolicy) -> u32 {
    state
        .bookings
        .iter()
        .filter(|b| b.holds_capacity(policy))
        .map(|b| b.party_size)
        .sum()
}

/// First date in `range` where existing occupancy plus `party_size` would
/// exceed `ceiling`, along with the occupancy on that date.
///
/// One sweep over the overlapping bookings instead of one occupancy query
/// per day: each booking contributes +party at its (clamped) first covered
/// date and -party just past its last, and the running level between
/// boundaries is the per-date occupancy.
pub fn first_overflow(
    state: &StoryState,
    range: &DayRange,
    ceiling: u32,
    party_size: u32,
    policy: CapacityPolicy,
) -> Option<(NaiveDate, u32)> {
    let mut deltas: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    deltas.insert(range.start, 0);

    for b in state.overlapping(range) {
        if !b.holds_capacity(policy) {
            continue;
        }
        let from = b.range.start.max(range.start);
        *deltas.entry(from).or_default() += i64::from(b.party_size);
        // The exit boundary one day past the clamped end; irrelevant when
        // it falls outside the queried range.
        if b.range.end < range.end
            && let Some(exit) = b.range.end.succ_opt()
        {
            *deltas.entry(exit).or_default() -= i64::from(b.party_size);
        }
    }

    let mut level: i64 = 0;
    for (date, delta) in deltas {
        if date > range.end {
            break;
        }
        level += delta;
        if level + i64::from(party_size) > i64::from(ceiling) {
            return Some((date, level as u32));
        }
    }
    None
}
