use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register<T: prometheus::core::Collector + Clone + 'static>(metric: T, name: &str) -> T {
    if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
        tracing::warn!(metric = name, error = %e, "failed to register metric");
    }
    metric
}

static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_fanout_active_connections",
        "Currently registered WebSocket connections",
    )
    .expect("failed to create realtime_fanout_active_connections");
    register(gauge, "realtime_fanout_active_connections")
});

static ONLINE_USERS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_fanout_online_users",
        "Users with at least one live connection",
    )
    .expect("failed to create realtime_fanout_online_users");
    register(gauge, "realtime_fanout_online_users")
});

static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_fanout_events_published_total",
            "Events published, by event type",
        ),
        &["type"],
    )
    .expect("failed to create realtime_fanout_events_published_total");
    register(counter, "realtime_fanout_events_published_total")
});

static DELIVERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_fanout_deliveries_total",
        "Frames queued to connections",
    )
    .expect("failed to create realtime_fanout_deliveries_total");
    register(counter, "realtime_fanout_deliveries_total")
});

static DELIVERY_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_fanout_delivery_failures_total",
            "Failed sends that tore down a connection, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create realtime_fanout_delivery_failures_total");
    register(counter, "realtime_fanout_delivery_failures_total")
});

static PRESENCE_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_fanout_presence_transitions_total",
            "Online/offline transitions",
        ),
        &["state"],
    )
    .expect("failed to create realtime_fanout_presence_transitions_total");
    register(counter, "realtime_fanout_presence_transitions_total")
});

static EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_fanout_evictions_total",
        "Connections removed from rooms after a membership revoke",
    )
    .expect("failed to create realtime_fanout_evictions_total");
    register(counter, "realtime_fanout_evictions_total")
});

static HANDSHAKE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_fanout_handshake_failures_total",
            "Refused WebSocket handshakes, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create realtime_fanout_handshake_failures_total");
    register(counter, "realtime_fanout_handshake_failures_total")
});

static INTENT_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_fanout_intent_rejections_total",
            "Client intents rejected by the gateway, by code",
        ),
        &["code"],
    )
    .expect("failed to create realtime_fanout_intent_rejections_total");
    register(counter, "realtime_fanout_intent_rejections_total")
});

pub fn set_active_connections(count: usize) {
    ACTIVE_CONNECTIONS.set(count as i64);
}

pub fn set_online_users(count: usize) {
    ONLINE_USERS.set(count as i64);
}

pub fn record_event_published(kind: &str) {
    EVENTS_PUBLISHED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_deliveries(count: usize) {
    DELIVERIES_TOTAL.inc_by(count as u64);
}

pub fn record_delivery_failure(reason: &str) {
    DELIVERY_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_presence_transition(state: &str) {
    PRESENCE_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
}

pub fn record_evictions(count: usize) {
    EVICTIONS_TOTAL.inc_by(count as u64);
}

pub fn record_handshake_failure(reason: &str) {
    HANDSHAKE_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_intent_rejection(code: &str) {
    INTENT_REJECTIONS_TOTAL.with_label_values(&[code]).inc();
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
