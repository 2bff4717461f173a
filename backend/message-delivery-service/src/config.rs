use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;
use transactional_outbox::OutboxProcessorConfig;
use uuid::Uuid;

use crate::error::AppError;
use crate::services::{AckConfig, DeliveryConfig, MessageServiceConfig};

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub retry_topic: String,
    pub dead_letter_topic: String,
    pub max_retries: u32,
    pub retry_base_backoff: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "message-delivery-service".to_string(),
            retry_topic: event_schema::topics::MESSAGE_RETRY.to_string(),
            dead_letter_topic: event_schema::topics::MESSAGE_DEAD_LETTER.to_string(),
            max_retries: 3,
            retry_base_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Publisher workers polling the outbox table
    pub workers: usize,
    pub processor: OutboxProcessorConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            processor: OutboxProcessorConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub timeline_window: usize,
    pub timeline_ttl: Duration,
    pub seq_warm_ttl: Duration,
    pub online_ttl: Duration,
    pub pending_ack_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeline_window: 100,
            timeline_ttl: Duration::from_secs(7 * 24 * 3600),
            seq_warm_ttl: Duration::from_secs(3600),
            online_ttl: Duration::from_secs(300),
            pending_ack_ttl: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub server_id: String,
    /// API, realtime, health and metrics listener
    pub http_port: u16,
    pub kafka: KafkaConfig,
    pub outbox: OutboxConfig,
    pub cache: CacheConfig,
    pub messages: MessageServiceConfig,
    pub delivery: DeliveryConfig,
    pub ack: AckConfig,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| AppError::Config(format!("invalid value for {key}: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn secs_env(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}

fn millis_env(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_env(key, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenv();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL is required".into()))?;

        let kafka_defaults = KafkaConfig::default();
        let kafka = KafkaConfig {
            brokers: env::var("KAFKA_BROKERS").unwrap_or(kafka_defaults.brokers),
            group_id: env::var("KAFKA_GROUP_ID").unwrap_or(kafka_defaults.group_id),
            retry_topic: env::var("KAFKA_RETRY_TOPIC").unwrap_or(kafka_defaults.retry_topic),
            dead_letter_topic: env::var("KAFKA_DEAD_LETTER_TOPIC")
                .unwrap_or(kafka_defaults.dead_letter_topic),
            max_retries: parse_env("CONSUMER_MAX_RETRIES", kafka_defaults.max_retries)?,
            retry_base_backoff: secs_env(
                "CONSUMER_RETRY_BASE_SECS",
                kafka_defaults.retry_base_backoff,
            )?,
        };

        let processor_defaults = OutboxProcessorConfig::default();
        let outbox = OutboxConfig {
            workers: parse_env("OUTBOX_WORKERS", OutboxConfig::default().workers)?,
            processor: OutboxProcessorConfig {
                batch_size: parse_env("OUTBOX_BATCH_SIZE", processor_defaults.batch_size)?,
                poll_interval: millis_env(
                    "OUTBOX_POLL_INTERVAL_MS",
                    processor_defaults.poll_interval,
                )?,
                max_retries: parse_env("OUTBOX_MAX_RETRIES", processor_defaults.max_retries)?,
                cleanup_interval: secs_env(
                    "OUTBOX_CLEANUP_INTERVAL_SECS",
                    processor_defaults.cleanup_interval,
                )?,
                retention: secs_env("OUTBOX_RETENTION_SECS", processor_defaults.retention)?,
                ..processor_defaults
            },
        };

        let cache_defaults = CacheConfig::default();
        let cache = CacheConfig {
            timeline_window: parse_env("TIMELINE_WINDOW", cache_defaults.timeline_window)?,
            timeline_ttl: secs_env("TIMELINE_TTL_SECS", cache_defaults.timeline_ttl)?,
            seq_warm_ttl: secs_env("SEQ_WARM_TTL_SECS", cache_defaults.seq_warm_ttl)?,
            online_ttl: secs_env("ONLINE_TTL_SECS", cache_defaults.online_ttl)?,
            pending_ack_ttl: secs_env("PENDING_ACK_TTL_SECS", cache_defaults.pending_ack_ttl)?,
        };

        let message_defaults = MessageServiceConfig::default();
        let messages = MessageServiceConfig {
            fanout_concurrency: parse_env(
                "INBOX_FANOUT_CONCURRENCY",
                message_defaults.fanout_concurrency,
            )?,
            revoke_window: secs_env("REVOKE_WINDOW_SECS", message_defaults.revoke_window)?,
            timeline_window: cache.timeline_window,
            ..message_defaults
        };

        let delivery_defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            reconnect_batch: parse_env("RECONNECT_BATCH", delivery_defaults.reconnect_batch)?,
            max_offline_attempts: parse_env(
                "OFFLINE_MAX_ATTEMPTS",
                delivery_defaults.max_offline_attempts,
            )?,
            offline_retention: secs_env(
                "OFFLINE_RETENTION_SECS",
                delivery_defaults.offline_retention,
            )?,
            cleanup_interval: secs_env(
                "OFFLINE_CLEANUP_INTERVAL_SECS",
                delivery_defaults.cleanup_interval,
            )?,
        };

        let ack_defaults = AckConfig::default();
        let ack = AckConfig {
            resend_interval: secs_env("ACK_RESEND_INTERVAL_SECS", ack_defaults.resend_interval)?,
            sweep_interval: secs_env("ACK_SWEEP_INTERVAL_SECS", ack_defaults.sweep_interval)?,
            max_retry: parse_env("ACK_MAX_RETRY", ack_defaults.max_retry)?,
            sweep_batch: parse_env("ACK_SWEEP_BATCH", ack_defaults.sweep_batch)?,
        };

        Ok(Self {
            database_url,
            database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 20)?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            server_id: env::var("SERVER_ID").unwrap_or_else(|_| Uuid::new_v4().to_string()),
            http_port: parse_env("HTTP_PORT", 8080)?,
            kafka,
            outbox,
            cache,
            messages,
            delivery,
            ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let kafka = KafkaConfig::default();
        assert_eq!(kafka.retry_topic, "im.message.retry");
        assert_eq!(kafka.max_retries, 3);

        let cache = CacheConfig::default();
        assert_eq!(cache.timeline_window, 100);
        assert_eq!(cache.online_ttl, Duration::from_secs(300));
        assert_eq!(OutboxConfig::default().workers, 2);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        env::set_var("MDS_TEST_PARSE_ENV", "not-a-number");
        assert!(matches!(
            parse_env::<u16>("MDS_TEST_PARSE_ENV", 1),
            Err(AppError::Config(_))
        ));
        env::remove_var("MDS_TEST_PARSE_ENV");
        assert_eq!(parse_env::<u16>("MDS_TEST_PARSE_ENV", 7).unwrap(), 7);
    }
}
