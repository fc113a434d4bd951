use chrono::Datelike;

use crate::limits::*;
use crate::model::{Availability, CapacityPolicy, DayRange, StoryState, Traveller};

use super::ledger::{first_overflow, pool_occupancy};
use super::EngineError;

/// Calendar sanity for any range accepted from a caller.
pub(crate) fn validate_range(range: &DayRange) -> Result<(), EngineError> {
    if range.end < range.start {
        return Err(EngineError::InvalidDate(format!(
            "end {} is before start {}",
            range.end, range.start
        )));
    }
    if range.start.year() < MIN_VALID_YEAR || range.end.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if range.num_days() > MAX_TRIP_DAYS {
        return Err(EngineError::LimitExceeded("trip too long"));
    }
    Ok(())
}

pub(crate) fn validate_party(
    party_size: u32,
    travellers: &[Traveller],
) -> Result<(), EngineError> {
    if party_size == 0 || party_size > MAX_PARTY_SIZE {
        return Err(EngineError::InvalidPartySize(party_size));
    }
    if travellers.len() != party_size as usize {
        return Err(EngineError::TravellerCountMismatch {
            party_size,
            travellers: travellers.len(),
        });
    }
    for t in travellers {
        if t.full_name.len() > MAX_TRAVELLER_FIELD_LEN
            || t.email.len() > MAX_TRAVELLER_FIELD_LEN
            || t.phone.len() > MAX_TRAVELLER_FIELD_LEN
        {
            return Err(EngineError::LimitExceeded("traveller field too long"));
        }
    }
    Ok(())
}

/// The capacity validator: status gate, then duration/window gate, then the
/// capacity gate appropriate to the story's availability shape.
///
/// Pure read-then-decide over the state the caller already holds. Callers
/// needing atomicity must invoke this while holding the story's write lock,
/// which `Engine::create_booking` does.
pub(crate) fn validate_booking(
    state: &StoryState,
    range: &DayRange,
    party_size: u32,
    policy: CapacityPolicy,
) -> Result<(), EngineError> {
    let story = &state.story;
    if !story.status.is_bookable() {
        return Err(EngineError::NotBookable(story.id));
    }

    match story.availability {
        Availability::YearRound {
            trip_days,
            daily_capacity,
        } => {
            if range.num_days() != i64::from(trip_days) {
                return Err(EngineError::DurationMismatch {
                    requested: *range,
                    expected: story.availability,
                });
            }
            // Per-date ceiling: every date of the range must fit.
            if let Some((date, _)) =
                first_overflow(state, range, daily_capacity, party_size, policy)
            {
                return Err(EngineError::CapacityExceeded {
                    ceiling: daily_capacity,
                    date,
                });
            }
        }
        Availability::Scheduled { window, capacity } => {
            if !window.contains_range(range) {
                return Err(EngineError::DurationMismatch {
                    requested: *range,
                    expected: story.availability,
                });
            }
            // One traveller pool shared across the whole window.
            let occupancy = pool_occupancy(state, policy);
            if occupancy + party_size > capacity {
                return Err(EngineError::CapacityExceeded {
                    ceiling: capacity,
                    date: range.start,
                });
            }
        }
    }
    Ok(())
}
