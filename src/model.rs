use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

/// Inclusive calendar-date range `[start, end]`. A one-day trip has
/// `start == end` and covers one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DayRange start must not be after end");
        Self { start, end }
    }

    /// Number of calendar dates covered, inclusive of both endpoints.
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Returns true if `other` lies entirely inside `self`.
    pub fn contains_range(&self, other: &DayRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &DayRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Catalog lifecycle. Only `Published` stories can be booked or searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    Published,
    Suspended,
}

impl StoryStatus {
    pub fn is_bookable(self) -> bool {
        matches!(self, StoryStatus::Published)
    }
}

/// How a story sells its capacity. The two shapes carry disjoint fields so
/// a capacity check cannot read the wrong ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Availability {
    /// Bookable on any date: travellers must request exactly `trip_days`
    /// consecutive dates, and each date admits at most `daily_capacity`
    /// travellers.
    YearRound { trip_days: u32, daily_capacity: u32 },
    /// A single departure window. All bookings must lie inside `window` and
    /// share one pool of `capacity` travellers.
    Scheduled { window: DayRange, capacity: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityKind {
    YearRound,
    Scheduled,
}

impl Availability {
    pub fn kind(&self) -> AvailabilityKind {
        match self {
            Availability::YearRound { .. } => AvailabilityKind::YearRound,
            Availability::Scheduled { .. } => AvailabilityKind::Scheduled,
        }
    }

    /// The traveller ceiling this shape enforces (per date or per window).
    pub fn ceiling(&self) -> u32 {
        match *self {
            Availability::YearRound { daily_capacity, .. } => daily_capacity,
            Availability::Scheduled { capacity, .. } => capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingMode {
    PerPerson,
    PerDay,
}

/// A story's advertised price. `total_amount` is the host's precomputed
/// package total, used verbatim for per-day stories.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub mode: PricingMode,
    pub unit_amount: f64,
    pub total_amount: Option<f64>,
}

/// A bookable travel experience. Geo/text attributes feed search only; the
/// availability shape and status gate booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: Ulid,
    pub host_id: Ulid,
    pub name: String,
    pub status: StoryStatus,
    pub availability: Availability,
    pub pricing: Pricing,
    pub coords: Option<GeoPoint>,
    pub district: Option<String>,
    pub state: Option<String>,
    pub town: Option<String>,
    pub suburb: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traveller {
    pub full_name: String,
    pub email: String,
    pub phone: String,
}

/// Reservation-level state, independent of payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    Confirmed,
    Cancelled,
}

/// Payment-level state, resolved by the external payment workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Success,
    Rejected,
}

/// Which bookings the capacity ledger counts as holding seats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Every confirmed reservation whose payment has not been rejected.
    ConfirmedOnly,
    /// Only confirmed reservations whose payment has settled.
    PaidOnly,
}

/// The two booking-creation flows. The flow fixes both the ledger policy
/// used during validation and the payment state a new booking starts in.
/// This is a product policy difference, not two code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingFlow {
    /// Host-side immediate booking: payment settles out of band, so the
    /// booking is inserted paid and every confirmed reservation counts.
    Direct,
    /// Traveller pay-before-hold checkout: inserted with payment pending;
    /// only settled reservations count toward capacity.
    Checkout,
}

impl BookingFlow {
    pub fn capacity_policy(self) -> CapacityPolicy {
        match self {
            BookingFlow::Direct => CapacityPolicy::ConfirmedOnly,
            BookingFlow::Checkout => CapacityPolicy::PaidOnly,
        }
    }

    pub fn initial_payment(self) -> PaymentState {
        match self {
            BookingFlow::Direct => PaymentState::Success,
            BookingFlow::Checkout => PaymentState::Pending,
        }
    }
}

/// Server-computed price split, captured at booking time and never
/// re-derived afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingBreakdown {
    pub base_total: f64,
    pub fee_total: f64,
    pub grand_total: f64,
}

/// A traveller's reservation against a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub story_id: Ulid,
    pub requester_id: Ulid,
    pub range: DayRange,
    pub party_size: u32,
    pub travellers: Vec<Traveller>,
    pub confirmation: ConfirmationState,
    pub payment: PaymentState,
    pub flow: BookingFlow,
    pub pricing: PricingBreakdown,
    pub created_at: Ms,
}

impl Booking {
    /// Whether this booking occupies capacity under `policy`.
    pub fn holds_capacity(&self, policy: CapacityPolicy) -> bool {
        if self.confirmation != ConfirmationState::Confirmed {
            return false;
        }
        match policy {
            CapacityPolicy::ConfirmedOnly => self.payment != PaymentState::Rejected,
            CapacityPolicy::PaidOnly => self.payment == PaymentState::Success,
        }
    }
}

/// One story plus every booking taken against it, sorted by range start so
/// occupancy scans can skip non-overlapping records.
#[derive(Debug, Clone)]
pub struct StoryState {
    pub story: Story,
    pub bookings: Vec<Booking>,
}

impl StoryState {
    pub fn new(story: Story) -> Self {
        Self {
            story,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `range.start`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose range overlaps `query`. Binary search skips records
    /// starting after `query.end`.
    pub fn overlapping(&self, query: &DayRange) -> impl Iterator<Item = &Booking> {
        let right = self
            .bookings
            .partition_point(|b| b.range.start <= query.end);
        let start = query.start;
        self.bookings[..right]
            .iter()
            .filter(move |b| b.range.end >= start)
    }
}

/// WAL record format: every state change is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StoryCreated { story: Story },
    StoryUpdated { story: Story },
    StoryStatusChanged { id: Ulid, status: StoryStatus },
    StoryDeleted { id: Ulid },
    BookingCreated { booking: Booking },
    BookingCancelled { id: Ulid, story_id: Ulid },
    PaymentResolved { id: Ulid, story_id: Ulid, outcome: PaymentState },
}

impl Event {
    /// The story the event belongs to.
    pub fn story_id(&self) -> Ulid {
        match self {
            Event::StoryCreated { story } | Event::StoryUpdated { story } => story.id,
            Event::StoryStatusChanged { id, .. } | Event::StoryDeleted { id } => *id,
            Event::BookingCreated { booking } => booking.story_id,
            Event::BookingCancelled { story_id, .. }
            | Event::PaymentResolved { story_id, .. } => *story_id,
        }
    }
}
