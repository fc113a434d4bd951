use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::model::Ms;

/// Background sweep cancelling checkout bookings whose payment never
/// arrived. An abandoned checkout would otherwise hold its record forever;
/// its seats were never counted (checkout flow counts paid only), so this
/// is bookkeeping rather than capacity release, but the cancel event tells
/// subscribers and compaction can drop the record.
pub async fn run_reaper(engine: Arc<Engine>, checkout_ttl: Duration) {
    let ttl_ms = checkout_ttl.as_millis() as Ms;
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as Ms;
        for booking_id in engine.collect_stale_checkouts(now, ttl_ms) {
            match engine.cancel_booking(booking_id).await {
                Ok(_) => info!("reaped stale checkout {booking_id}"),
                // Raced with a payment webhook or an explicit cancel.
                Err(e) => debug!("reaper skip {booking_id}: {e}"),
            }
        }
    }
}

/// Background WAL compactor: rewrites the log once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
