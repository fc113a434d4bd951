//! Wire request shapes and their conversion into typed engine inputs.
//!
//! One JSON object per line, discriminated by `"op"`. Dates cross the wire
//! as ISO `YYYY-MM-DD` strings and are parsed here so a malformed date is
//! an `invalid_date` rejection, not a protocol error.

use chrono::NaiveDate;
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::{BookingRequest, EngineError, SearchRequest, SortBy};
use crate::model::*;

/// Default result-page size for search.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug)]
pub enum ProtocolError {
    Empty,
    Parse(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty request"),
            ProtocolError::Parse(msg) => write!(f, "malformed request: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello { secret: String },
    CreateStory(StorySpec),
    UpdateStory(StorySpec),
    SetStoryStatus { id: Ulid, status: StoryStatus },
    DeleteStory { id: Ulid },
    GetStory { id: Ulid },
    ListStories,
    CreateBooking(BookingSpec),
    CancelBooking { id: Ulid },
    ResolvePayment { id: Ulid, outcome: PaymentState },
    GetBooking { id: Ulid },
    StoryBookings { story_id: Ulid },
    Occupancy {
        story_id: Ulid,
        date: String,
        #[serde(default = "default_policy")]
        policy: CapacityPolicy,
    },
    Search(SearchSpec),
    Subscribe { story_id: Ulid },
}

fn default_policy() -> CapacityPolicy {
    CapacityPolicy::ConfirmedOnly
}

pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    serde_json::from_str(trimmed).map_err(|e| ProtocolError::Parse(e.to_string()))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    s.parse()
        .map_err(|_| EngineError::InvalidDate(s.to_string()))
}

fn parse_range(start: &str, end: &str) -> Result<DayRange, EngineError> {
    let start = parse_date(start)?;
    let end = parse_date(end)?;
    if end < start {
        return Err(EngineError::InvalidDate(format!(
            "end {end} is before start {start}"
        )));
    }
    Ok(DayRange::new(start, end))
}

// ── Story ────────────────────────────────────────────────

/// Availability as written on the wire, window dates still strings.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AvailabilitySpec {
    YearRound {
        trip_days: u32,
        daily_capacity: u32,
    },
    Scheduled {
        window_start: String,
        window_end: String,
        capacity: u32,
    },
}

impl AvailabilitySpec {
    fn into_availability(self) -> Result<Availability, EngineError> {
        Ok(match self {
            AvailabilitySpec::YearRound {
                trip_days,
                daily_capacity,
            } => Availability::YearRound {
                trip_days,
                daily_capacity,
            },
            AvailabilitySpec::Scheduled {
                window_start,
                window_end,
                capacity,
            } => Availability::Scheduled {
                window: parse_range(&window_start, &window_end)?,
                capacity,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StorySpec {
    pub id: Option<Ulid>,
    pub host_id: Ulid,
    pub name: String,
    #[serde(default = "default_story_status")]
    pub status: StoryStatus,
    pub availability: AvailabilitySpec,
    pub pricing: Pricing,
    pub coords: Option<GeoPoint>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub town: Option<String>,
    pub suburb: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_story_status() -> StoryStatus {
    StoryStatus::Draft
}

impl StorySpec {
    /// Build the story document, minting an id when none was supplied.
    pub fn into_story(self) -> Result<Story, EngineError> {
        Ok(Story {
            id: self.id.unwrap_or_else(Ulid::new),
            host_id: self.host_id,
            name: self.name,
            status: self.status,
            availability: self.availability.into_availability()?,
            pricing: self.pricing,
            coords: self.coords,
            district: self.district,
            state: self.state,
            town: self.town,
            suburb: self.suburb,
            tags: self.tags,
        })
    }
}

// ── Booking ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BookingSpec {
    pub id: Option<Ulid>,
    pub story_id: Ulid,
    pub requester_id: Ulid,
    pub start_date: String,
    pub end_date: String,
    pub party_size: u32,
    #[serde(default)]
    pub travellers: Vec<Traveller>,
    pub client_total: Option<f64>,
    #[serde(default = "default_flow")]
    pub flow: BookingFlow,
}

fn default_flow() -> BookingFlow {
    BookingFlow::Direct
}

impl BookingSpec {
    pub fn into_request(self) -> Result<BookingRequest, EngineError> {
        Ok(BookingRequest {
            id: self.id.unwrap_or_else(Ulid::new),
            story_id: self.story_id,
            requester_id: self.requester_id,
            range: parse_range(&self.start_date, &self.end_date)?,
            party_size: self.party_size,
            travellers: self.travellers,
            client_total: self.client_total,
            flow: self.flow,
        })
    }
}

// ── Search ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OriginSpec {
    pub lat: f64,
    pub lon: f64,
    pub state_hint: Option<String>,
    pub district_hint: Option<String>,
    pub name_hint: Option<String>,
    pub suburb_hint: Option<String>,
    pub town_hint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FiltersSpec {
    #[serde(default)]
    pub tags: Vec<String>,
    pub availability_type: Option<AvailabilityKind>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchSpec {
    pub origin: OriginSpec,
    pub search_date: String,
    pub party_size: u32,
    #[serde(default)]
    pub filters: Option<FiltersSpec>,
    pub sort_by: Option<SortBy>,
    pub limit: Option<usize>,
}

impl SearchSpec {
    pub fn into_request(self) -> Result<SearchRequest, EngineError> {
        let filters = self.filters.unwrap_or_default();
        Ok(SearchRequest {
            origin: GeoPoint {
                lat: self.origin.lat,
                lon: self.origin.lon,
            },
            date: parse_date(&self.search_date)?,
            party_size: self.party_size,
            state_hint: self.origin.state_hint,
            district_hint: self.origin.district_hint,
            name_hint: self.origin.name_hint,
            suburb_hint: self.origin.suburb_hint,
            town_hint: self.origin.town_hint,
            tags: filters.tags,
            kind: filters.availability_type,
            budget_min: filters.budget_min,
            budget_max: filters.budget_max,
            sort: self.sort_by.unwrap_or_default(),
            limit: self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
        })
    }
}
