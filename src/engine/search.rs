use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{ledger, Engine, EngineError, SharedStoryState};

/// Primary proximity stage radius.
pub const PROXIMITY_RADIUS_KM: f64 = 500.0;
/// Below this many assembled results the same-state fallback kicks in.
pub const RESULT_FLOOR: usize = 10;
/// Same-state fallback never returns more than this many extras.
const SAME_STATE_CAP: usize = 20;

const TEXT_MATCH_BONUS: f64 = 100.0;
const DISTRICT_BONUS: f64 = 30.0;
const STATE_BONUS: f64 = 20.0;
const TAG_BONUS: f64 = 10.0;
const AVAILABILITY_BONUS: f64 = 25.0;
const HEADROOM_BONUS: f64 = 15.0;
/// Remaining capacity must cover the party this many times over for the
/// headroom bonus.
const HEADROOM_FACTOR: f64 = 1.2;
/// Stand-in distance score for coordinate-less stories that matched on an
/// administrative boundary.
const NO_COORDS_BOUNDARY_SCORE: f64 = 30.0;
/// Same-state fallback candidates score flat instead of the full formula.
const FALLBACK_BASE_SCORE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    PriceLowToHigh,
    PriceHighToLow,
}

/// A traveller's search: where they are, when they travel, how many seats
/// they need, and what they can spend.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub origin: GeoPoint,
    pub date: NaiveDate,
    pub party_size: u32,
    pub state_hint: Option<String>,
    pub district_hint: Option<String>,
    pub name_hint: Option<String>,
    pub suburb_hint: Option<String>,
    pub town_hint: Option<String>,
    pub tags: Vec<String>,
    pub kind: Option<AvailabilityKind>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub sort: SortBy,
    pub limit: usize,
}

impl SearchRequest {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.origin.is_valid() {
            return Err(EngineError::InvalidCoordinates {
                lat: self.origin.lat,
                lon: self.origin.lon,
            });
        }
        if self.party_size == 0 || self.party_size > MAX_PARTY_SIZE {
            return Err(EngineError::InvalidPartySize(self.party_size));
        }
        if self.date.year() < MIN_VALID_YEAR || self.date.year() > MAX_VALID_YEAR {
            return Err(EngineError::InvalidDate(self.date.to_string()));
        }
        if self.limit == 0 || self.limit > MAX_RESULT_LIMIT {
            return Err(EngineError::LimitExceeded("result limit"));
        }
        Ok(())
    }

    /// Every non-empty administrative hint, for the fallback stage.
    fn admin_hints(&self) -> Vec<&str> {
        [
            &self.district_hint,
            &self.state_hint,
            &self.name_hint,
            &self.town_hint,
            &self.suburb_hint,
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .filter(|h| !h.is_empty())
        .collect()
    }
}

/// One story as the planner saw it: the document, its distance from the
/// origin when it has coordinates, and the occupancy relevant to the
/// searched date (per-date for year-round, shared pool for scheduled).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub story: Story,
    pub distance_km: Option<f64>,
    pub occupancy: u32,
}

impl Candidate {
    fn remaining_capacity(&self) -> u32 {
        self.story.availability.ceiling().saturating_sub(self.occupancy)
    }
}

/// A ranked, priced result ready for the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredStory {
    pub story_id: Ulid,
    pub title: String,
    pub tags: Vec<String>,
    pub pricing_mode: PricingMode,
    pub display_price: f64,
    pub calculated_total: f64,
    pub final_score: f64,
    pub price_note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredStory>,
    pub total: usize,
}

/// The search engine's read model. The engine itself provides the
/// in-process implementation; the seam exists so an external listing store
/// can stand in without touching planner or scoring.
#[async_trait]
pub trait StoryIndex: Send + Sync {
    /// Bookable stories within `radius_km` of `origin`, nearest first.
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        cap: usize,
    ) -> Vec<Candidate>;

    /// Bookable stories whose administrative fields match any hint
    /// (case-insensitive substring), excluding already-found ids.
    async fn by_admin_hints(
        &self,
        hints: &[&str],
        origin: GeoPoint,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        exclude: &HashSet<Ulid>,
        cap: usize,
    ) -> Vec<Candidate>;

    /// Any bookable story in `state`, excluding already-found ids.
    async fn by_state(
        &self,
        state: &str,
        origin: GeoPoint,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        exclude: &HashSet<Ulid>,
        cap: usize,
    ) -> Vec<Candidate>;
}

/// Great-circle distance.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0088;
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

// ── Scoring ──────────────────────────────────────────────

fn matches_ci(field: Option<&String>, hint: Option<&String>) -> bool {
    match (field, hint) {
        (Some(f), Some(h)) => f.eq_ignore_ascii_case(h),
        _ => false,
    }
}

/// Can this story satisfy the request's date and party at all? Ineligible
/// candidates are dropped, not down-ranked.
fn eligible(c: &Candidate, req: &SearchRequest) -> bool {
    match c.story.availability {
        Availability::YearRound { daily_capacity, .. } => daily_capacity >= req.party_size,
        Availability::Scheduled { window, capacity } => {
            window.contains(req.date) && capacity >= req.party_size
        }
    }
}

fn priced(c: &Candidate, req: &SearchRequest, final_score: f64) -> ScoredStory {
    let story = &c.story;
    let (calculated_total, note_head) = match story.pricing.mode {
        PricingMode::PerPerson => (
            story.pricing.unit_amount * f64::from(req.party_size),
            "per person",
        ),
        PricingMode::PerDay => (
            story.pricing.total_amount.unwrap_or(story.pricing.unit_amount),
            "package price",
        ),
    };
    ScoredStory {
        story_id: story.id,
        title: story.name.clone(),
        tags: story.tags.clone(),
        pricing_mode: story.pricing.mode,
        display_price: story.pricing.unit_amount,
        calculated_total,
        final_score,
        price_note: format!("{note_head} · {}", req.date.format("%B %Y")),
    }
}

/// Full relevance formula for stage 1/2 candidates.
fn score(c: &Candidate, req: &SearchRequest) -> Option<ScoredStory> {
    if !eligible(c, req) {
        return None;
    }
    let story = &c.story;
    let mut total = 0.0;

    let name_owned = Some(story.name.clone());
    for (field, hint) in [
        (name_owned.as_ref(), req.name_hint.as_ref()),
        (story.suburb.as_ref(), req.suburb_hint.as_ref()),
        (story.town.as_ref(), req.town_hint.as_ref()),
    ] {
        if matches_ci(field, hint) {
            total += TEXT_MATCH_BONUS;
        }
    }

    let district_hit = matches_ci(story.district.as_ref(), req.district_hint.as_ref());
    let state_hit = matches_ci(story.state.as_ref(), req.state_hint.as_ref());
    if district_hit {
        total += DISTRICT_BONUS;
    }
    if state_hit {
        total += STATE_BONUS;
    }

    let tag_hits = story
        .tags
        .iter()
        .filter(|t| req.tags.iter().any(|r| r.eq_ignore_ascii_case(t)))
        .count();
    total += TAG_BONUS * tag_hits as f64;

    total += match c.distance_km {
        Some(km) => (100.0 - km * 2.0).max(0.0),
        None if district_hit || state_hit => NO_COORDS_BOUNDARY_SCORE,
        None => 0.0,
    };

    // Every survivor of the eligibility gate earns the availability bonus.
    total += AVAILABILITY_BONUS;

    if f64::from(c.remaining_capacity()) >= HEADROOM_FACTOR * f64::from(req.party_size) {
        total += HEADROOM_BONUS;
    }

    Some(priced(c, req, total))
}

/// Same-state fallback candidates get a flat base instead of the formula.
fn score_fallback(c: &Candidate, req: &SearchRequest) -> Option<ScoredStory> {
    if !eligible(c, req) {
        return None;
    }
    Some(priced(c, req, FALLBACK_BASE_SCORE + AVAILABILITY_BONUS))
}

// ── Assembly ─────────────────────────────────────────────

fn within_budget(r: &ScoredStory, req: &SearchRequest) -> bool {
    let min = req.budget_min.unwrap_or(0.0);
    let max = req.budget_max.unwrap_or(f64::INFINITY);
    r.calculated_total >= min && r.calculated_total <= max
}

/// Stable sort, so equal keys keep their stage order.
fn sort_results(results: &mut [ScoredStory], sort: SortBy) {
    match sort {
        SortBy::Relevance => {
            results.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        }
        SortBy::PriceLowToHigh => {
            results.sort_by(|a, b| a.calculated_total.total_cmp(&b.calculated_total));
        }
        SortBy::PriceHighToLow => {
            results.sort_by(|a, b| b.calculated_total.total_cmp(&a.calculated_total));
        }
    }
}

/// Run the staged search against `index` and assemble the final page.
///
/// Stage 1 queries by proximity; stage 2 widens to administrative-hint
/// matches only when stage 1 under-produces; the same-state stage 3 runs
/// only when the assembled page is still below `RESULT_FLOOR`. A stage
/// yielding nothing is empty input to the next, never a failure.
pub async fn search(
    index: &dyn StoryIndex,
    req: &SearchRequest,
) -> Result<SearchResponse, EngineError> {
    req.validate()?;
    let budget = req.limit.max(20);

    let mut candidates = index
        .nearby(req.origin, PROXIMITY_RADIUS_KM, req.date, req.kind, budget * 3)
        .await;
    let mut seen: HashSet<Ulid> = candidates.iter().map(|c| c.story.id).collect();

    let hints = req.admin_hints();
    if candidates.len() < budget && !hints.is_empty() {
        let widened = index
            .by_admin_hints(&hints, req.origin, req.date, req.kind, &seen, budget * 2)
            .await;
        seen.extend(widened.iter().map(|c| c.story.id));
        candidates.extend(widened);
    }

    let mut results: Vec<ScoredStory> =
        candidates.iter().filter_map(|c| score(c, req)).collect();
    results.retain(|r| within_budget(r, req));
    sort_results(&mut results, req.sort);

    if results.len() < RESULT_FLOOR
        && let Some(state) = req.state_hint.as_deref()
    {
        let extras = index
            .by_state(state, req.origin, req.date, req.kind, &seen, SAME_STATE_CAP)
            .await;
        results.extend(
            extras
                .iter()
                .filter_map(|c| score_fallback(c, req))
                .filter(|r| within_budget(r, req)),
        );
        sort_results(&mut results, req.sort);
    }

    results.truncate(req.limit);
    let total = results.len();
    Ok(SearchResponse { results, total })
}

// ── Engine-backed index ──────────────────────────────────

impl Engine {
    fn states_snapshot(&self) -> Vec<SharedStoryState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}

fn candidate(st: &StoryState, origin: GeoPoint, date: NaiveDate) -> Candidate {
    // Search shows live availability: any confirmed, not-rejected booking
    // occupies a seat from a traveller's point of view.
    let occupancy = match st.story.availability {
        Availability::YearRound { .. } => {
            ledger::occupancy_on(st, date, CapacityPolicy::ConfirmedOnly)
        }
        Availability::Scheduled { .. } => {
            ledger::pool_occupancy(st, CapacityPolicy::ConfirmedOnly)
        }
    };
    Candidate {
        distance_km: st.story.coords.map(|c| haversine_km(origin, c)),
        occupancy,
        story: st.story.clone(),
    }
}

fn kind_matches(story: &Story, kind: Option<AvailabilityKind>) -> bool {
    kind.is_none_or(|k| story.availability.kind() == k)
}

#[async_trait]
impl StoryIndex for Engine {
    async fn nearby(
        &self,
        origin: GeoPoint,
        radius_km: f64,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        cap: usize,
    ) -> Vec<Candidate> {
        let mut found = Vec::new();
        for st in self.states_snapshot() {
            let guard = st.read().await;
            if !guard.story.status.is_bookable() || !kind_matches(&guard.story, kind) {
                continue;
            }
            let c = candidate(&guard, origin, date);
            if c.distance_km.is_some_and(|km| km <= radius_km) {
                found.push(c);
            }
        }
        found.sort_by(|a, b| {
            a.distance_km
                .unwrap_or(f64::INFINITY)
                .total_cmp(&b.distance_km.unwrap_or(f64::INFINITY))
        });
        found.truncate(cap);
        found
    }

    async fn by_admin_hints(
        &self,
        hints: &[&str],
        origin: GeoPoint,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        exclude: &HashSet<Ulid>,
        cap: usize,
    ) -> Vec<Candidate> {
        let lowered: Vec<String> = hints.iter().map(|h| h.to_lowercase()).collect();
        let mut found = Vec::new();
        for st in self.states_snapshot() {
            if found.len() >= cap {
                break;
            }
            let guard = st.read().await;
            let story = &guard.story;
            if exclude.contains(&story.id)
                || !story.status.is_bookable()
                || !kind_matches(story, kind)
            {
                continue;
            }
            let name = Some(&story.name);
            let fields = [
                name,
                story.district.as_ref(),
                story.state.as_ref(),
                story.town.as_ref(),
                story.suburb.as_ref(),
            ];
            let hit = fields.into_iter().flatten().any(|f| {
                let f = f.to_lowercase();
                lowered.iter().any(|h| f.contains(h))
            });
            if hit {
                found.push(candidate(&guard, origin, date));
            }
        }
        found
    }

    async fn by_state(
        &self,
        state: &str,
        origin: GeoPoint,
        date: NaiveDate,
        kind: Option<AvailabilityKind>,
        exclude: &HashSet<Ulid>,
        cap: usize,
    ) -> Vec<Candidate> {
        let mut found = Vec::new();
        for st in self.states_snapshot() {
            if found.len() >= cap {
                break;
            }
            let guard = st.read().await;
            let story = &guard.story;
            if exclude.contains(&story.id)
                || !story.status.is_bookable()
                || !kind_matches(story, kind)
            {
                continue;
            }
            if story
                .state
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(state))
            {
                found.push(candidate(&guard, origin, date));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn base_story() -> Story {
        Story {
            id: Ulid::new(),
            host_id: Ulid::new(),
            name: "Coorg Coffee Estate Walk".into(),
            status: StoryStatus::Published,
            availability: Availability::YearRound {
                trip_days: 2,
                daily_capacity: 12,
            },
            pricing: Pricing {
                mode: PricingMode::PerPerson,
                unit_amount: 90.0,
                total_amount: None,
            },
            coords: Some(GeoPoint {
                lat: 12.42,
                lon: 75.74,
            }),
            district: Some("Kodagu".into()),
            state: Some("Karnataka".into()),
            town: Some("Madikeri".into()),
            suburb: None,
            tags: vec!["coffee".into(), "trek".into()],
        }
    }

    fn base_request() -> SearchRequest {
        SearchRequest {
            origin: GeoPoint {
                lat: 12.97,
                lon: 77.59,
            },
            date: d("2026-03-15"),
            party_size: 2,
            state_hint: None,
            district_hint: None,
            name_hint: None,
            suburb_hint: None,
            town_hint: None,
            tags: Vec::new(),
            kind: None,
            budget_min: None,
            budget_max: None,
            sort: SortBy::Relevance,
            limit: 20,
        }
    }

    fn cand(story: Story, distance_km: Option<f64>, occupancy: u32) -> Candidate {
        Candidate {
            story,
            distance_km,
            occupancy,
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Bengaluru to Mysuru is roughly 130 km as the crow flies.
        let blr = GeoPoint {
            lat: 12.9716,
            lon: 77.5946,
        };
        let mys = GeoPoint {
            lat: 12.2958,
            lon: 76.6394,
        };
        let km = haversine_km(blr, mys);
        assert!((125.0..135.0).contains(&km), "got {km}");
    }

    #[test]
    fn haversine_zero_for_same_point() {
        let p = GeoPoint { lat: 10.0, lon: 76.0 };
        assert!(haversine_km(p, p).abs() < 1e-9);
    }

    #[test]
    fn district_match_is_worth_exactly_thirty() {
        let req = SearchRequest {
            district_hint: Some("Kodagu".into()),
            ..base_request()
        };
        let with = score(&cand(base_story(), Some(40.0), 0), &req).unwrap();

        let mut other = base_story();
        other.district = Some("Hassan".into());
        let without = score(&cand(other, Some(40.0), 0), &req).unwrap();

        assert!((with.final_score - without.final_score - 30.0).abs() < 1e-9);
    }

    #[test]
    fn closer_candidate_never_scores_lower_on_distance() {
        let req = base_request();
        let near = score(&cand(base_story(), Some(10.0), 0), &req).unwrap();
        let far = score(&cand(base_story(), Some(45.0), 0), &req).unwrap();
        assert!(near.final_score > far.final_score);

        // Decay bottoms out at zero, never negative.
        let very_far = score(&cand(base_story(), Some(300.0), 0), &req).unwrap();
        let beyond = score(&cand(base_story(), Some(450.0), 0), &req).unwrap();
        assert!((very_far.final_score - beyond.final_score).abs() < 1e-9);
    }

    #[test]
    fn text_matches_add_up() {
        let req = SearchRequest {
            name_hint: Some("coorg coffee estate walk".into()),
            town_hint: Some("MADIKERI".into()),
            ..base_request()
        };
        let scored = score(&cand(base_story(), None, 0), &req).unwrap();
        // 100 (name) + 100 (town) + 25 (availability) + 15 (headroom); no
        // boundary match, no coords → distance contributes 0.
        assert!((scored.final_score - 240.0).abs() < 1e-9);
    }

    #[test]
    fn missing_coords_scores_thirty_only_with_boundary_match() {
        let mut story = base_story();
        story.coords = None;

        let plain = base_request();
        let no_boundary = score(&cand(story.clone(), None, 0), &plain).unwrap();

        let req = SearchRequest {
            state_hint: Some("Karnataka".into()),
            ..base_request()
        };
        let with_boundary = score(&cand(story, None, 0), &req).unwrap();

        // 20 (state) + 30 (no-coords stand-in) more than the plain case.
        assert!((with_boundary.final_score - no_boundary.final_score - 50.0).abs() < 1e-9);
    }

    #[test]
    fn tag_overlap_counts_each_tag() {
        let req = SearchRequest {
            tags: vec!["trek".into(), "COFFEE".into(), "beach".into()],
            ..base_request()
        };
        let tagged = score(&cand(base_story(), Some(40.0), 0), &req).unwrap();
        let untagged = score(&cand(base_story(), Some(40.0), 0), &base_request()).unwrap();
        assert!((tagged.final_score - untagged.final_score - 20.0).abs() < 1e-9);
    }

    #[test]
    fn party_too_large_is_dropped_not_downranked() {
        let req = SearchRequest {
            party_size: 13, // daily_capacity is 12
            ..base_request()
        };
        assert!(score(&cand(base_story(), Some(10.0), 0), &req).is_none());
    }

    #[test]
    fn scheduled_outside_window_is_dropped() {
        let mut story = base_story();
        story.availability = Availability::Scheduled {
            window: DayRange::new(d("2026-01-10"), d("2026-01-20")),
            capacity: 30,
        };
        let req = base_request(); // searches 2026-03-15
        assert!(score(&cand(story.clone(), Some(10.0), 0), &req).is_none());

        let in_window = SearchRequest {
            date: d("2026-01-12"),
            ..base_request()
        };
        assert!(score(&cand(story, Some(10.0), 0), &in_window).is_some());
    }

    #[test]
    fn headroom_bonus_needs_slack() {
        let req = SearchRequest {
            party_size: 5,
            ..base_request()
        };
        // remaining 12-0=12 >= 6.0 → bonus
        let roomy = score(&cand(base_story(), Some(40.0), 0), &req).unwrap();
        // remaining 12-7=5 < 6.0 → no bonus
        let tight = score(&cand(base_story(), Some(40.0), 7), &req).unwrap();
        assert!((roomy.final_score - tight.final_score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn per_person_total_scales_per_day_does_not() {
        let req = SearchRequest {
            party_size: 4,
            ..base_request()
        };
        let per_person = score(&cand(base_story(), Some(40.0), 0), &req).unwrap();
        assert_eq!(per_person.calculated_total, 360.0);

        let mut story = base_story();
        story.pricing = Pricing {
            mode: PricingMode::PerDay,
            unit_amount: 150.0,
            total_amount: Some(300.0),
        };
        let per_day = score(&cand(story, Some(40.0), 0), &req).unwrap();
        assert_eq!(per_day.calculated_total, 300.0);
        assert!(per_day.price_note.contains("March 2026"));
    }

    #[test]
    fn fallback_score_is_flat() {
        let req = base_request();
        let scored = score_fallback(&cand(base_story(), Some(5.0), 0), &req).unwrap();
        assert_eq!(scored.final_score, 45.0);

        // Still gated on eligibility.
        let big_party = SearchRequest {
            party_size: 13,
            ..base_request()
        };
        assert!(score_fallback(&cand(base_story(), Some(5.0), 0), &big_party).is_none());
    }

    // ── Planner stages against a scripted index ──────────

    struct ScriptedIndex {
        near: Vec<Candidate>,
        admin: Vec<Candidate>,
        state: Vec<Candidate>,
    }

    #[async_trait]
    impl StoryIndex for ScriptedIndex {
        async fn nearby(
            &self,
            _origin: GeoPoint,
            _radius_km: f64,
            _date: NaiveDate,
            _kind: Option<AvailabilityKind>,
            cap: usize,
        ) -> Vec<Candidate> {
            self.near.iter().take(cap).cloned().collect()
        }

        async fn by_admin_hints(
            &self,
            _hints: &[&str],
            _origin: GeoPoint,
            _date: NaiveDate,
            _kind: Option<AvailabilityKind>,
            exclude: &HashSet<Ulid>,
            cap: usize,
        ) -> Vec<Candidate> {
            self.admin
                .iter()
                .filter(|c| !exclude.contains(&c.story.id))
                .take(cap)
                .cloned()
                .collect()
        }

        async fn by_state(
            &self,
            _state: &str,
            _origin: GeoPoint,
            _date: NaiveDate,
            _kind: Option<AvailabilityKind>,
            exclude: &HashSet<Ulid>,
            cap: usize,
        ) -> Vec<Candidate> {
            self.state
                .iter()
                .filter(|c| !exclude.contains(&c.story.id))
                .take(cap)
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn admin_fallback_runs_when_proximity_under_produces() {
        let shared = cand(base_story(), Some(10.0), 0);
        let index = ScriptedIndex {
            near: vec![shared.clone()],
            // The admin stage is handed the proximity id in `exclude`, so
            // only the second candidate may come back.
            admin: vec![shared, cand(base_story(), None, 0)],
            state: Vec::new(),
        };
        let req = SearchRequest {
            district_hint: Some("Kodagu".into()),
            ..base_request()
        };
        let resp = search(&index, &req).await.unwrap();
        assert_eq!(resp.total, 2);
        let ids: HashSet<_> = resp.results.iter().map(|r| r.story_id).collect();
        assert_eq!(ids.len(), 2, "stages must not duplicate a story");
    }

    #[tokio::test]
    async fn same_state_fallback_fills_thin_pages() {
        let index = ScriptedIndex {
            near: vec![cand(base_story(), Some(10.0), 0)],
            admin: Vec::new(),
            state: (0..4).map(|_| cand(base_story(), None, 0)).collect(),
        };
        let req = SearchRequest {
            state_hint: Some("Karnataka".into()),
            ..base_request()
        };
        let resp = search(&index, &req).await.unwrap();
        assert_eq!(resp.total, 5);
        // Fallback extras carry the flat score and rank below the scored hit.
        assert!(resp.results[0].final_score > 45.0);
        assert!(resp.results[1..].iter().all(|r| r.final_score == 45.0));
    }

    #[tokio::test]
    async fn no_state_hint_means_no_third_stage() {
        let index = ScriptedIndex {
            near: Vec::new(),
            admin: Vec::new(),
            state: vec![cand(base_story(), None, 0)],
        };
        let resp = search(&index, &base_request()).await.unwrap();
        assert_eq!(resp.total, 0);
    }

    #[tokio::test]
    async fn budget_filter_and_price_sort() {
        let mut cheap = base_story();
        cheap.pricing.unit_amount = 40.0;
        let mut mid = base_story();
        mid.pricing.unit_amount = 90.0;
        let mut steep = base_story();
        steep.pricing.unit_amount = 400.0;

        let index = ScriptedIndex {
            near: vec![
                cand(steep, Some(5.0), 0),
                cand(cheap, Some(10.0), 0),
                cand(mid, Some(15.0), 0),
            ],
            admin: Vec::new(),
            state: Vec::new(),
        };
        let req = SearchRequest {
            party_size: 2,
            budget_max: Some(500.0), // steep costs 800 for two, filtered out
            sort: SortBy::PriceLowToHigh,
            ..base_request()
        };
        let resp = search(&index, &req).await.unwrap();
        assert_eq!(resp.total, 2);
        assert_eq!(resp.results[0].calculated_total, 80.0);
        assert_eq!(resp.results[1].calculated_total, 180.0);
    }

    #[tokio::test]
    async fn limit_truncates_after_ranking() {
        let index = ScriptedIndex {
            near: (0..30).map(|i| cand(base_story(), Some(f64::from(i)), 0)).collect(),
            admin: Vec::new(),
            state: Vec::new(),
        };
        let req = SearchRequest {
            limit: 5,
            ..base_request()
        };
        let resp = search(&index, &req).await.unwrap();
        assert_eq!(resp.total, 5);
        // Nearest (highest distance score) first under relevance sort.
        assert!(resp.results[0].final_score >= resp.results[4].final_score);
    }

    #[tokio::test]
    async fn invalid_inputs_rejected() {
        let index = ScriptedIndex {
            near: Vec::new(),
            admin: Vec::new(),
            state: Vec::new(),
        };
        let bad_coords = SearchRequest {
            origin: GeoPoint {
                lat: 95.0,
                lon: 76.0,
            },
            ..base_request()
        };
        assert!(matches!(
            search(&index, &bad_coords).await.unwrap_err(),
            EngineError::InvalidCoordinates { .. }
        ));

        let bad_party = SearchRequest {
            party_size: 0,
            ..base_request()
        };
        assert!(matches!(
            search(&index, &bad_party).await.unwrap_err(),
            EngineError::InvalidPartySize(0)
        ));

        let bad_date = SearchRequest {
            date: d("1999-01-01"),
            ..base_request()
        };
        assert!(matches!(
            search(&index, &bad_date).await.unwrap_err(),
            EngineError::InvalidDate(_)
        ));
    }
}
