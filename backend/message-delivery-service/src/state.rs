use std::sync::Arc;

use actix_web::{web, HttpResponse};
use sqlx::PgPool;

use crate::redis_client::RedisClient;
use crate::services::{AckService, MessageService, SessionManager, SyncService};

/// Services shared with request handlers and realtime sessions.
#[derive(Clone)]
pub struct AppState {
    pub messages: Arc<MessageService>,
    pub sync: Arc<SyncService>,
    pub sessions: Arc<SessionManager>,
    pub acks: Arc<AckService>,
}

/// Backing stores checked by `/ready`.
#[derive(Clone)]
pub struct Backends {
    pub db: PgPool,
    pub redis: RedisClient,
}

/// Liveness: the process is up.
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Readiness: Postgres and Redis answer.
pub async fn ready(backends: web::Data<Backends>) -> HttpResponse {
    if let Err(e) = sqlx::query("SELECT 1").execute(&backends.db).await {
        tracing::warn!(error = %e, "Readiness check: database unavailable");
        return HttpResponse::ServiceUnavailable().body("database unavailable");
    }

    let mut conn = backends.redis.manager();
    let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
    if let Err(e) = pong {
        tracing::warn!(error = %e, "Readiness check: redis unavailable");
        return HttpResponse::ServiceUnavailable().body("redis unavailable");
    }

    HttpResponse::Ok().body("READY")
}
