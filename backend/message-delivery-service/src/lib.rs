//! Message ordering and delivery core.
//!
//! Messages are sequenced per conversation, committed together with an outbox
//! row, published to Kafka by outbox workers, and fanned out to recipients by
//! the delivery consumer: live pushes tracked until acknowledged, offline
//! storage replayed on reconnect.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod redis_client;
pub mod repository;
pub mod routes;
pub mod services;
pub mod state;
pub mod tasks;
pub mod websocket;

pub const SERVICE_NAME: &str = "message-delivery-service";
