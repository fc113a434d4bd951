//! Input hygiene bounds. Requests beyond these are rejected with
//! `EngineError::LimitExceeded` before touching any state.

pub const MAX_STORIES: usize = 100_000;
pub const MAX_BOOKINGS_PER_STORY: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TAGS: usize = 32;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_TRAVELLER_FIELD_LEN: usize = 256;

/// Upper bound on a single booking's party, and therefore on the traveller
/// manifest length.
pub const MAX_PARTY_SIZE: u32 = 500;

/// Longest bookable trip, in calendar days (inclusive range length).
pub const MAX_TRIP_DAYS: i64 = 90;

/// Calendar sanity window for any date accepted on the wire.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

/// Hard cap on the `limit` a search request may ask for.
pub const MAX_RESULT_LIMIT: usize = 100;

/// Longest accepted wire frame (one JSON request per line).
pub const MAX_LINE_LEN: usize = 64 * 1024;
