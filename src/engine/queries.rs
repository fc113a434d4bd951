use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{ledger, Engine, EngineError, SharedStoryState};

impl Engine {
    pub async fn story(&self, id: Ulid) -> Option<Story> {
        let st = self.get_story(&id)?;
        let guard = st.read().await;
        Some(guard.story.clone())
    }

    pub async fn list_stories(&self) -> Vec<Story> {
        let states: Vec<SharedStoryState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut stories = Vec::with_capacity(states.len());
        for st in states {
            stories.push(st.read().await.story.clone());
        }
        stories
    }

    pub async fn bookings_for(&self, story_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let st = self
            .get_story(&story_id)
            .ok_or(EngineError::StoryNotFound(story_id))?;
        let guard = st.read().await;
        Ok(guard.bookings.clone())
    }

    pub async fn booking(&self, id: Ulid) -> Option<Booking> {
        let story_id = self.story_for_booking(&id)?;
        let st = self.get_story(&story_id)?;
        let guard = st.read().await;
        guard.booking(id).cloned()
    }

    /// Live occupancy for one story and date under an explicit counting
    /// policy. Always computed from current state, never cached.
    pub async fn occupancy(
        &self,
        story_id: Ulid,
        date: NaiveDate,
        policy: CapacityPolicy,
    ) -> Result<u32, EngineError> {
        let st = self
            .get_story(&story_id)
            .ok_or(EngineError::StoryNotFound(story_id))?;
        let guard = st.read().await;
        Ok(match guard.story.availability {
            Availability::YearRound { .. } => ledger::occupancy_on(&guard, date, policy),
            // Scheduled stories answer with their shared pool.
            Availability::Scheduled { .. } => ledger::pool_occupancy(&guard, policy),
        })
    }
}
