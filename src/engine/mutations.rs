use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validate::{validate_booking, validate_party, validate_range};
use super::{now_ms, pricing, Engine, EngineError, SharedStoryState, WalCommand};

/// Everything a caller supplies to open a booking. The requester identity
/// arrives already verified; pricing is recomputed server-side and
/// `client_total`, when present, is only checked against it.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub story_id: Ulid,
    pub requester_id: Ulid,
    pub range: DayRange,
    pub party_size: u32,
    pub travellers: Vec<Traveller>,
    pub client_total: Option<f64>,
    pub flow: BookingFlow,
}

fn validate_story_doc(story: &Story) -> Result<(), EngineError> {
    if story.name.is_empty() || story.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("story name length"));
    }
    if story.tags.len() > MAX_TAGS {
        return Err(EngineError::LimitExceeded("too many tags"));
    }
    if story.tags.iter().any(|t| t.len() > MAX_TAG_LEN) {
        return Err(EngineError::LimitExceeded("tag too long"));
    }
    if story.pricing.unit_amount < 0.0 || story.pricing.total_amount.is_some_and(|t| t < 0.0) {
        return Err(EngineError::LimitExceeded("negative price"));
    }
    if let Some(coords) = &story.coords
        && !coords.is_valid()
    {
        return Err(EngineError::InvalidCoordinates {
            lat: coords.lat,
            lon: coords.lon,
        });
    }
    match story.availability {
        Availability::YearRound {
            trip_days,
            daily_capacity,
        } => {
            if trip_days == 0 || i64::from(trip_days) > MAX_TRIP_DAYS {
                return Err(EngineError::LimitExceeded("trip length"));
            }
            if daily_capacity == 0 {
                return Err(EngineError::LimitExceeded("daily capacity must be at least one"));
            }
        }
        Availability::Scheduled { window, capacity } => {
            validate_range(&window)?;
            if capacity == 0 {
                return Err(EngineError::LimitExceeded("window capacity must be at least one"));
            }
        }
    }
    Ok(())
}

impl Engine {
    // ── Story catalog ────────────────────────────────────

    pub async fn create_story(&self, story: Story) -> Result<(), EngineError> {
        if self.state.len() >= MAX_STORIES {
            return Err(EngineError::LimitExceeded("too many stories"));
        }
        validate_story_doc(&story)?;
        if self.state.contains_key(&story.id) {
            return Err(EngineError::AlreadyExists(story.id));
        }

        let event = Event::StoryCreated {
            story: story.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(story.id, Arc::new(RwLock::new(StoryState::new(story.clone()))));
        metrics::gauge!(crate::observability::STORIES_LIVE).set(self.state.len() as f64);
        self.notify.send(story.id, &event);
        Ok(())
    }

    /// Replace the story document. Bookings already taken are untouched:
    /// they validated against the shape in force when they were made.
    pub async fn update_story(&self, story: Story) -> Result<(), EngineError> {
        validate_story_doc(&story)?;
        let st = self
            .get_story(&story.id)
            .ok_or(EngineError::StoryNotFound(story.id))?;
        let mut guard = st.write().await;

        let id = story.id;
        let event = Event::StoryUpdated { story };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn set_story_status(
        &self,
        id: Ulid,
        status: StoryStatus,
    ) -> Result<(), EngineError> {
        let st = self.get_story(&id).ok_or(EngineError::StoryNotFound(id))?;
        let mut guard = st.write().await;

        let event = Event::StoryStatusChanged { id, status };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_story(&self, id: Ulid) -> Result<(), EngineError> {
        let st = self.get_story(&id).ok_or(EngineError::StoryNotFound(id))?;
        {
            let guard = st.read().await;
            for b in &guard.bookings {
                self.booking_to_story.remove(&b.id);
            }
        }

        let event = Event::StoryDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        metrics::gauge!(crate::observability::STORIES_LIVE).set(self.state.len() as f64);
        self.notify.send(id, &event);
        Ok(())
    }

    // ── Booking transaction ──────────────────────────────

    /// Open a booking: load, validate, price, insert as one atomic unit.
    ///
    /// The story's write lock is held from before validation until after
    /// the WAL commit, so two concurrent attempts against the same story
    /// serialize and the second revalidates against the first's bookings.
    /// Any failure returns before the WAL append and leaves no trace.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_range(&req.range)?;
        validate_party(req.party_size, &req.travellers)?;

        let st = self
            .get_story(&req.story_id)
            .ok_or(EngineError::StoryNotFound(req.story_id))?;
        let mut guard = st.write().await;

        if guard.bookings.len() >= MAX_BOOKINGS_PER_STORY {
            return Err(EngineError::LimitExceeded("too many bookings on story"));
        }
        if self.booking_to_story.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        validate_booking(
            &guard,
            &req.range,
            req.party_size,
            req.flow.capacity_policy(),
        )?;

        let base = pricing::base_total(&guard.story, &req.range, req.party_size);
        let breakdown = self.fees.breakdown(base);
        if let Some(client_total) = req.client_total {
            pricing::verify_client_total(breakdown.grand_total, client_total)?;
        }

        let booking = Booking {
            id: req.id,
            story_id: req.story_id,
            requester_id: req.requester_id,
            range: req.range,
            party_size: req.party_size,
            travellers: req.travellers,
            confirmation: ConfirmationState::Confirmed,
            payment: req.flow.initial_payment(),
            flow: req.flow,
            pricing: breakdown,
            created_at: now_ms(),
        };

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(req.story_id, &mut guard, &event)
            .await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Reservation-level cancel. Idempotent: cancelling a booking that is
    /// already cancelled reports success without writing anything.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (story_id, mut guard) = self.resolve_booking_write(&id).await?;
        match guard.booking(id) {
            None => return Err(EngineError::BookingNotFound(id)),
            Some(b) if b.confirmation == ConfirmationState::Cancelled => return Ok(story_id),
            Some(_) => {}
        }
        let event = Event::BookingCancelled { id, story_id };
        self.persist_and_apply(story_id, &mut guard, &event).await?;
        Ok(story_id)
    }

    /// The seam the external payment workflow calls once the gateway
    /// settles. Rejected bookings stop holding capacity under both
    /// counting policies.
    pub async fn resolve_payment(
        &self,
        id: Ulid,
        outcome: PaymentState,
    ) -> Result<Ulid, EngineError> {
        if outcome == PaymentState::Pending {
            return Err(EngineError::InvalidPaymentOutcome);
        }
        let (story_id, mut guard) = self.resolve_booking_write(&id).await?;
        match guard.booking(id) {
            None => return Err(EngineError::BookingNotFound(id)),
            Some(b) if b.payment == outcome => return Ok(story_id),
            Some(_) => {}
        }
        let event = Event::PaymentResolved {
            id,
            story_id,
            outcome,
        };
        self.persist_and_apply(story_id, &mut guard, &event).await?;
        Ok(story_id)
    }

    /// Checkout-flow bookings still payment-pending after `ttl_ms`. Stories
    /// whose lock is busy are skipped; the next sweep catches them.
    pub fn collect_stale_checkouts(&self, now: Ms, ttl_ms: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for entry in self.state.iter() {
            let st = entry.value().clone();
            if let Ok(guard) = st.try_read() {
                for b in &guard.bookings {
                    if b.flow == BookingFlow::Checkout
                        && b.confirmation == ConfirmationState::Confirmed
                        && b.payment == PaymentState::Pending
                        && now - b.created_at >= ttl_ms
                    {
                        stale.push(b.id);
                    }
                }
            }
        }
        stale
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state: one create per story, one create per surviving booking.
    /// Cancelled bookings are dropped at this point.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let stories: Vec<SharedStoryState> =
            self.state.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        let mut seen = HashSet::new();
        for st in stories {
            let guard = st.read().await;
            if !seen.insert(guard.story.id) {
                continue;
            }
            events.push(Event::StoryCreated {
                story: guard.story.clone(),
            });
            for b in &guard.bookings {
                if b.confirmation == ConfirmationState::Confirmed {
                    events.push(Event::BookingCreated { booking: b.clone() });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
