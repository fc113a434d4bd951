use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests served. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "wayfare_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "wayfare_request_duration_seconds";

/// Counter: bookings committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "wayfare_bookings_created_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "wayfare_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "wayfare_connections_total";

/// Counter: connections rejected at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "wayfare_connections_rejected_total";

/// Counter: sessions that failed the hello handshake.
pub const AUTH_FAILURES_TOTAL: &str = "wayfare_auth_failures_total";

/// Gauge: stories in the catalog.
pub const STORIES_LIVE: &str = "wayfare_stories_live";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "wayfare_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "wayfare_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op without one.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Short label per request variant for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::CreateStory { .. } => "create_story",
        Request::UpdateStory { .. } => "update_story",
        Request::SetStoryStatus { .. } => "set_story_status",
        Request::DeleteStory { .. } => "delete_story",
        Request::GetStory { .. } => "get_story",
        Request::ListStories => "list_stories",
        Request::CreateBooking { .. } => "create_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ResolvePayment { .. } => "resolve_payment",
        Request::GetBooking { .. } => "get_booking",
        Request::StoryBookings { .. } => "story_bookings",
        Request::Occupancy { .. } => "occupancy",
        Request::Search(_) => "search",
        Request::Subscribe { .. } => "subscribe",
    }
}
