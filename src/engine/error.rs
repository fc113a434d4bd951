use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Availability, DayRange};

/// Everything a booking or search request can be rejected with. Domain
/// rejections are final; the caller must change the request and resubmit.
/// `WalError` is the one infrastructure failure; the wire layer reports it
/// as `internal` so clients can tell "invalid request" from "try again".
#[derive(Debug)]
pub enum EngineError {
    StoryNotFound(Ulid),
    BookingNotFound(Ulid),
    AlreadyExists(Ulid),
    /// Story exists but its lifecycle status does not admit bookings.
    NotBookable(Ulid),
    /// Requested range violates the story's availability shape: wrong trip
    /// length for a year-round story, or not inside the scheduled window.
    DurationMismatch {
        requested: DayRange,
        expected: Availability,
    },
    /// Carries the ceiling and the first date that would overflow it.
    CapacityExceeded { ceiling: u32, date: NaiveDate },
    TravellerCountMismatch { party_size: u32, travellers: usize },
    /// Client-submitted total disagrees with the server recomputation
    /// beyond tolerance. The server total is authoritative.
    PricingMismatch { client_total: f64, server_total: f64 },
    InvalidPartySize(u32),
    InvalidDate(String),
    InvalidCoordinates { lat: f64, lon: f64 },
    InvalidPaymentOutcome,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code used on the wire and as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::StoryNotFound(_) => "story_not_found",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotBookable(_) => "not_bookable",
            EngineError::DurationMismatch { .. } => "duration_mismatch",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::TravellerCountMismatch { .. } => "traveller_count_mismatch",
            EngineError::PricingMismatch { .. } => "pricing_mismatch",
            EngineError::InvalidPartySize(_) => "invalid_party_size",
            EngineError::InvalidDate(_) => "invalid_date",
            EngineError::InvalidCoordinates { .. } => "invalid_coordinates",
            EngineError::InvalidPaymentOutcome => "invalid_payment_outcome",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    /// True for failures of the store itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::StoryNotFound(id) => write!(f, "story not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotBookable(id) => write!(f, "story {id} is not open for booking"),
            EngineError::DurationMismatch {
                requested,
                expected,
            } => match expected {
                Availability::YearRound { trip_days, .. } => write!(
                    f,
                    "requested [{}, {}] spans {} days; this story requires exactly {trip_days}",
                    requested.start,
                    requested.end,
                    requested.num_days()
                ),
                Availability::Scheduled { window, .. } => write!(
                    f,
                    "requested [{}, {}] is not inside the departure window [{}, {}]",
                    requested.start, requested.end, window.start, window.end
                ),
            },
            EngineError::CapacityExceeded { ceiling, date } => {
                write!(f, "capacity {ceiling} exceeded on {date}")
            }
            EngineError::TravellerCountMismatch {
                party_size,
                travellers,
            } => write!(
                f,
                "party size {party_size} does not match {travellers} named travellers"
            ),
            EngineError::PricingMismatch {
                client_total,
                server_total,
            } => write!(
                f,
                "submitted total {client_total:.2} disagrees with server total {server_total:.2}"
            ),
            EngineError::InvalidPartySize(n) => write!(f, "invalid party size: {n}"),
            EngineError::InvalidDate(s) => write!(f, "invalid date: {s}"),
            EngineError::InvalidCoordinates { lat, lon } => {
                write!(f, "invalid coordinates: ({lat}, {lon})")
            }
            EngineError::InvalidPaymentOutcome => {
                write!(f, "payment outcome must be success or rejected")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
