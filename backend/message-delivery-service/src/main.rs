use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use event_schema::EventType;
use message_delivery_service::{
    config::Config,
    db, logging, metrics,
    redis_client::RedisClient,
    repository::{
        InboxStore, MembershipClient, MessageStore, OfflineStore, OnlineRegistry,
        PendingAckStore, PgMembership, PgMessageStore, PgOfflineStore, RedisInbox,
        RedisOnlineRegistry, RedisPendingAck, RedisSequencer, RedisTimeline, Sequencer,
        TimelineCache,
    },
    routes,
    services::{
        AckService, DeliveryEventHandler, DeliveryRouter, KafkaPushNotifier, MessageService,
        RoutedPushTransport, SessionManager, SyncService,
    },
    state::{self, AppState, Backends},
    tasks::BackgroundTasks,
    websocket::{run_relay_subscriber, ConnectionArena, RedisPushRelay},
    SERVICE_NAME,
};
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use reliable_consumer::{
    ConsumerMetrics, Dispatcher, FailurePolicy, KafkaEnvelopeSink, ReliableConsumer,
    ReliableConsumerConfig,
};
use transactional_outbox::{
    metrics::OutboxMetrics, KafkaOutboxPublisher, OutboxProcessor, SqlxOutboxRepository,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = Config::from_env()?;
    tracing::info!(server_id = %cfg.server_id, "Starting {}", SERVICE_NAME);

    let pool = db::init_pool(&cfg.database_url, cfg.database_max_connections)
        .await
        .context("Failed to initialize database")?;
    let redis = RedisClient::from_url(&cfg.redis_url)
        .await
        .context("Failed to connect to Redis")?;

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &cfg.kafka.brokers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("message.timeout.ms", "30000")
        .create()
        .context("Failed to create Kafka producer")?;

    // Storage
    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool.clone()));
    let sequencer: Arc<dyn Sequencer> = Arc::new(RedisSequencer::new(
        redis.manager(),
        store.clone(),
        cfg.cache.seq_warm_ttl,
    ));
    let timeline: Arc<dyn TimelineCache> = Arc::new(RedisTimeline::new(
        redis.manager(),
        cfg.cache.timeline_window,
        cfg.cache.timeline_ttl,
    ));
    let inbox: Arc<dyn InboxStore> = Arc::new(RedisInbox::new(redis.manager()));
    let membership: Arc<dyn MembershipClient> = Arc::new(PgMembership::new(pool.clone()));
    let online: Arc<dyn OnlineRegistry> =
        Arc::new(RedisOnlineRegistry::new(redis.manager(), cfg.cache.online_ttl));
    let pending_acks: Arc<dyn PendingAckStore> =
        Arc::new(RedisPendingAck::new(redis.manager(), cfg.cache.pending_ack_ttl));
    let offline: Arc<dyn OfflineStore> = Arc::new(PgOfflineStore::new(pool.clone()));

    // Delivery
    let arena = ConnectionArena::new();
    let transport = Arc::new(RoutedPushTransport::new(
        cfg.server_id.clone(),
        arena.clone(),
        Arc::new(RedisPushRelay::new(redis.manager())),
    ));
    let router = Arc::new(DeliveryRouter::new(
        online.clone(),
        transport,
        pending_acks.clone(),
        offline,
        Arc::new(KafkaPushNotifier::new(producer.clone())),
        cfg.delivery.clone(),
    ));
    let acks = Arc::new(AckService::new(
        pending_acks,
        inbox.clone(),
        router.clone(),
        cfg.ack.clone(),
    ));

    let backends = Backends {
        db: pool.clone(),
        redis: redis.clone(),
    };
    let state = AppState {
        messages: Arc::new(MessageService::new(
            store.clone(),
            sequencer.clone(),
            timeline,
            inbox.clone(),
            membership.clone(),
            cfg.messages.clone(),
        )),
        sync: Arc::new(SyncService::new(store, sequencer, inbox, membership)),
        sessions: Arc::new(SessionManager::new(
            cfg.server_id.clone(),
            arena.clone(),
            online,
            router.clone(),
        )),
        acks: acks.clone(),
    };

    let mut tasks = BackgroundTasks::new();

    // Outbox publisher workers and cleanup
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let publisher = Arc::new(KafkaOutboxPublisher::new(producer.clone(), SERVICE_NAME));
    let outbox_metrics = OutboxMetrics::new(SERVICE_NAME);
    for _ in 0..cfg.outbox.workers.max(1) {
        let processor = OutboxProcessor::new(
            outbox_repo.clone(),
            publisher.clone(),
            cfg.outbox.processor.clone(),
        )
        .with_metrics(outbox_metrics.clone());
        let shutdown = tasks.shutdown_signal();
        tasks.spawn("outbox-worker", async move { processor.run(shutdown).await });
    }
    let cleanup = OutboxProcessor::new(outbox_repo, publisher, cfg.outbox.processor.clone());
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("outbox-cleanup", async move { cleanup.run_cleanup(shutdown).await });

    // Event consumers: source topics and the delayed-retry topic
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::new(DeliveryEventHandler::new(router.clone())),
            Arc::new(KafkaEnvelopeSink::new(producer)),
            FailurePolicy {
                max_retries: cfg.kafka.max_retries,
                base_backoff: cfg.kafka.retry_base_backoff,
            },
            cfg.kafka.retry_topic.clone(),
            cfg.kafka.dead_letter_topic.clone(),
        )
        .with_metrics(ConsumerMetrics::new(SERVICE_NAME)),
    );
    let topics: Vec<&str> = EventType::ALL.iter().map(|t| t.topic()).collect();
    let main_consumer = ReliableConsumer::new(
        ReliableConsumerConfig::main(&cfg.kafka.brokers, &cfg.kafka.group_id, &topics),
        dispatcher.clone(),
    )
    .context("Failed to create event consumer")?;
    let retry_consumer = ReliableConsumer::new(
        ReliableConsumerConfig::retry(
            &cfg.kafka.brokers,
            &cfg.kafka.group_id,
            &cfg.kafka.retry_topic,
        ),
        dispatcher,
    )
    .context("Failed to create retry consumer")?;
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("event-consumer", main_consumer.run(shutdown));
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("retry-consumer", retry_consumer.run(shutdown));

    // Delivery loops
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("resend-sweeper", async move { acks.run_resend_sweeper(shutdown).await });
    let shutdown = tasks.shutdown_signal();
    tasks.spawn("offline-cleanup", async move { router.run_offline_cleanup(shutdown).await });
    let relay = run_relay_subscriber(
        redis.client(),
        cfg.server_id.clone(),
        arena,
        tasks.shutdown_signal(),
    );
    tasks.spawn("push-relay", async move {
        if let Err(e) = relay.await {
            tracing::error!(error = %e, "Push relay subscriber failed");
        }
    });

    // API, realtime and ops endpoints; actix-web futures are not Send, so this runs in the foreground
    let bind_addr = format!("0.0.0.0:{}", cfg.http_port);
    tracing::info!(%bind_addr, "Serving HTTP and WebSocket");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(backends.clone()))
            .configure(routes::configure)
            .route("/health", web::get().to(state::health))
            .route("/ready", web::get().to(state::ready))
            .route("/metrics", web::get().to(metrics::serve_metrics))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {bind_addr}"))?
    .run();
    let server_handle = server.handle();

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            server_handle.stop(true).await;
        }
    }

    tasks.shutdown(SHUTDOWN_TIMEOUT).await;
    tracing::info!("{} stopped", SERVICE_NAME);
    Ok(())
}
