use prometheus::{IntCounterVec, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct ConsumerMetrics {
    /// Records handled successfully, by source topic
    pub handled: IntCounterVec,
    pub retried: IntCounterVec,
    pub dead_lettered: IntCounterVec,
    /// Retry records re-enqueued because they were not yet due
    pub deferred: IntCounterVec,
}

fn counter(name: &str, help: &str, service: &str) -> IntCounterVec {
    IntCounterVec::new(
        Opts::new(name, help).const_label("service", service.to_string()),
        &["topic"],
    )
    .expect("valid metric opts for consumer counter")
}

impl ConsumerMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let handled = counter(
            "consumer_records_handled_total",
            "Records processed successfully",
            service,
        );
        let retried = counter(
            "consumer_records_retried_total",
            "Records sent to the retry topic after a handler failure",
            service,
        );
        let dead_lettered = counter(
            "consumer_records_dead_lettered_total",
            "Records sent to the dead-letter topic",
            service,
        );
        let deferred = counter(
            "consumer_retry_deferred_total",
            "Retry records re-enqueued before their due time",
            service,
        );

        for metric in [
            Box::new(handled.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(retried.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(deferred.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register consumer metric: {}", e);
            }
        }

        Self {
            handled,
            retried,
            dead_lettered,
            deferred,
        }
    }
}
