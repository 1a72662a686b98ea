use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "chat_relay_active_sessions",
        "Sessions currently registered with this relay",
    )
    .expect("failed to create chat_relay_active_sessions");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register chat_relay_active_sessions");
    gauge
});

pub static FANOUT_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_relay_fanout_delivered_total",
        "Frames enqueued onto session outbound queues",
    )
    .expect("failed to create chat_relay_fanout_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_relay_fanout_delivered_total");
    counter
});

pub static FANOUT_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_relay_fanout_dropped_total",
        "Frames dropped because a session outbound queue was full",
    )
    .expect("failed to create chat_relay_fanout_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_relay_fanout_dropped_total");
    counter
});

pub static MESSAGES_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "chat_relay_messages_published_total",
        "Messages published to the broker",
    )
    .expect("failed to create chat_relay_messages_published_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_relay_messages_published_total");
    counter
});

pub static BROKER_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "chat_relay_broker_reconnects_total",
            "Broker reconnect attempts by path",
        ),
        &["path"],
    )
    .expect("failed to create chat_relay_broker_reconnects_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register chat_relay_broker_reconnects_total");
    counter
});

/// Prometheus text exposition of the default registry
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
