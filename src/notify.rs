use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: one channel per story, created on first subscribe.
/// Booking and catalog events fan out to whoever watches the story.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, story_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(story_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op when nobody is watching the story.
    pub fn send(&self, story_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&story_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a story's channel, e.g. after the story is deleted.
    pub fn remove(&self, story_id: &Ulid) {
        self.channels.remove(story_id);
    }
}
