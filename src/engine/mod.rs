mod error;
mod ledger;
mod mutations;
mod pricing;
mod queries;
mod search;
mod validate;

pub use error::EngineError;
pub use ledger::{first_overflow, occupancy_on, pool_occupancy};
pub use mutations::BookingRequest;
pub use pricing::{base_total, FeePolicy, PlatformFees, PRICE_TOLERANCE};
pub use search::{
    haversine_km, search, Candidate, ScoredStory, SearchRequest, SearchResponse, SortBy,
    StoryIndex, PROXIMITY_RADIUS_KM, RESULT_FLOOR,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedStoryState = Arc<RwLock<StoryState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends into one fsync.
/// Waits for an append, drains whatever else is already queued, flushes
/// once, then answers every waiter with the shared outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut deferred = None;
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch: Vec<PendingAppend> = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => {
                            batch.push((event, response));
                        }
                        other => {
                            // Finish the in-flight batch before the
                            // non-append command.
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
            }
            other => deferred = Some(other),
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these waiters are all told it failed).
    let flush_err = wal.flush_sync().err();
    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched above"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The marketplace core: story catalog, booking ledger, and the search
/// read model, durably backed by the WAL.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedStoryState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → story id.
    pub(super) booking_to_story: DashMap<Ulid, Ulid>,
    pub(super) fees: Arc<dyn FeePolicy>,
}

/// Apply an event to a StoryState. No locking; the caller holds the lock.
fn apply_to_story(st: &mut StoryState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::StoryUpdated { story } => {
            st.story = story.clone();
        }
        Event::StoryStatusChanged { status, .. } => {
            st.story.status = *status;
        }
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.story_id);
            st.insert_booking(booking.clone());
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = st.booking_mut(*id) {
                b.confirmation = ConfirmationState::Cancelled;
            }
        }
        Event::PaymentResolved { id, outcome, .. } => {
            if let Some(b) = st.booking_mut(*id) {
                b.payment = *outcome;
            }
        }
        // Created/Deleted act on the story map itself, not on one state.
        Event::StoryCreated { .. } | Event::StoryDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        fees: Arc<dyn FeePolicy>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_to_story: DashMap::new(),
            fees,
        };

        // Replay: we are the sole owner of these Arcs, so try_write always
        // succeeds instantly. blocking_write would panic here when replay
        // runs inside an async context.
        for event in &events {
            match event {
                Event::StoryCreated { story } => {
                    engine
                        .state
                        .insert(story.id, Arc::new(RwLock::new(StoryState::new(story.clone()))));
                }
                Event::StoryDeleted { id } => {
                    if let Some((_, st)) = engine.state.remove(id) {
                        let guard = st.try_read().expect("replay: uncontended read");
                        for b in &guard.bookings {
                            engine.booking_to_story.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(entry) = engine.state.get(&other.story_id()) {
                        let st = entry.value().clone();
                        drop(entry);
                        let mut guard = st.try_write().expect("replay: uncontended write");
                        apply_to_story(&mut guard, other, &engine.booking_to_story);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::STORIES_LIVE).set(engine.state.len() as f64);
        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_story(&self, id: &Ulid) -> Option<SharedStoryState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn story_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_story.get(booking_id).map(|e| *e.value())
    }

    /// Durable commit: WAL append, then apply to the locked state, then
    /// fan out to subscribers. A WAL failure leaves the state untouched.
    pub(super) async fn persist_and_apply(
        &self,
        story_id: Ulid,
        st: &mut StoryState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_story(st, event, &self.booking_to_story);
        self.notify.send(story_id, event);
        Ok(())
    }

    /// Resolve a booking id to its story and take the story's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<StoryState>), EngineError> {
        let story_id = self
            .story_for_booking(booking_id)
            .ok_or(EngineError::BookingNotFound(*booking_id))?;
        let st = self
            .get_story(&story_id)
            .ok_or(EngineError::StoryNotFound(story_id))?;
        let guard = st.write_owned().await;
        Ok((story_id, guard))
    }
}
