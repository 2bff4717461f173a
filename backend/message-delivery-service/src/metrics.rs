use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register_counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    counter
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help))
        .unwrap_or_else(|e| panic!("failed to create {name}: {e}"));
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    counter
}

/// Pushes by path (`local`, `relay`) and result (`ok`, `error`)
pub static PUSHES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "message_delivery_pushes_total",
        "Realtime pushes attempted by message-delivery-service",
        &["path", "result"],
    )
});

pub static OFFLINE_SAVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "message_delivery_offline_saved_total",
        "Messages stored for offline recipients",
    )
});

/// Offline replays on reconnect by result (`delivered`, `retry`, `failed`)
pub static OFFLINE_REPLAYED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_counter_vec(
        "message_delivery_offline_replayed_total",
        "Offline messages replayed on reconnect",
        &["result"],
    )
});

pub static RESENDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "message_delivery_resends_total",
        "Unacknowledged pushes resent",
    )
});

pub static ACK_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "message_delivery_ack_failed_total",
        "Pushes never acknowledged after all resends",
    )
});

pub static ACKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "message_delivery_acks_total",
        "Client acknowledgments that cleared a pending push",
    )
});

pub static LOCAL_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "message_delivery_local_connections",
        "Realtime connections attached to this instance",
    )
    .unwrap_or_else(|e| panic!("failed to create message_delivery_local_connections: {e}"));
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .unwrap_or_else(|e| panic!("failed to register message_delivery_local_connections: {e}"));
    gauge
});

pub async fn serve_metrics() -> HttpResponse {
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
