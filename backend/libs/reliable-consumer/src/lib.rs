//! # Reliable Kafka Consumer
//!
//! At-least-once Kafka consumption with delayed retry and dead-lettering,
//! without an external scheduler.
//!
//! ## Flow
//!
//! ```text
//! source topic ──► handler ──ok──────────────────────────► commit
//!                     │ retryable error, attempts < max
//!                     ├──► retry topic {retry_count, next_retry_at} ──► commit
//!                     │ permanent error, or attempts exhausted
//!                     └──► dead-letter topic {error_msg, ...}     ──► commit
//!
//! retry topic ──► not due yet? re-enqueue unchanged, pause <= 1s ──► commit
//!             └─► due: unwrap and run the handler as above
//! ```
//!
//! - **Manual commit**: `enable.auto.commit=false`; an offset is committed only
//!   after the record is handled or routed. A crash mid-way re-delivers.
//! - **Bounded retry**: with the default policy a record that always fails is
//!   attempted exactly 3 times and then dead-lettered.
//! - **No head-of-line blocking**: failures leave the partition through the
//!   retry or dead-letter topic, so later records keep flowing.
//!
//! Handlers must tolerate duplicates.
//!
//! ## Usage
//!
//! ```ignore
//! let dispatcher = Arc::new(
//!     Dispatcher::new(handler, sink, FailurePolicy::default(), "im.message.retry", "im.message.dead_letter")
//!         .with_metrics(ConsumerMetrics::new("message-delivery-service")),
//! );
//! let main = ReliableConsumer::new(ReliableConsumerConfig::main(brokers, group, &topics), dispatcher.clone())?;
//! let retry = ReliableConsumer::new(ReliableConsumerConfig::retry(brokers, group, "im.message.retry"), dispatcher)?;
//! tokio::spawn(main.run(shutdown_rx.clone()));
//! tokio::spawn(retry.run(shutdown_rx));
//! ```

mod consumer;
mod dispatcher;
pub mod envelope;
mod error;
pub mod metrics;
mod policy;
mod sink;

pub use consumer::{ReliableConsumer, ReliableConsumerConfig};
pub use dispatcher::{Dispatcher, EventHandler, InboundRecord, Outcome};
pub use envelope::{DeadLetterMessage, RetryMessage};
pub use error::{ConsumerError, ConsumerResult, HandlerError};
pub use metrics::ConsumerMetrics;
pub use policy::{Disposition, FailurePolicy};
pub use sink::{EnvelopeSink, KafkaEnvelopeSink};
