use actix_web::{delete, get, post, put, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::SendMessageRequest;
use crate::services::SyncCursor;
use crate::state::AppState;

// Caller identity is asserted by the gateway; handlers take it from the request.

#[derive(Debug, Deserialize)]
pub struct Caller {
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub after_seq: Option<i64>,
    pub before_seq: Option<i64>,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReadRequest {
    pub user_id: Uuid,
    pub read_seq: i64,
}

#[derive(Debug, Deserialize)]
pub struct SettingsRequest {
    pub user_id: Uuid,
    pub muted: Option<bool>,
    pub pinned: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CursorBody {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub after_seq: i64,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub cursors: Vec<CursorBody>,
    #[serde(default)]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    pub limit: i64,
}

/// POST /messages
#[post("/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let message = state.messages.send_message(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(message))
}

/// GET /messages/{id}
#[get("/messages/{id}")]
pub async fn get_message(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let message = state.messages.get_message(message_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(message))
}

/// POST /messages/{id}/revoke
#[post("/messages/{id}/revoke")]
pub async fn revoke_message(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    body: web::Json<Caller>,
) -> Result<HttpResponse, AppError> {
    let message = state
        .messages
        .revoke_message(body.user_id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// DELETE /messages/{id}?user_id=
#[delete("/messages/{id}")]
pub async fn delete_message(
    state: web::Data<AppState>,
    message_id: web::Path<Uuid>,
    caller: web::Query<Caller>,
) -> Result<HttpResponse, AppError> {
    state
        .messages
        .delete_message(caller.user_id, message_id.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /conversations/{id}/messages?after_seq=&before_seq=&limit=
///
/// `before_seq` pages backwards; otherwise reads forward from `after_seq` (default 0).
#[get("/conversations/{id}/messages")]
pub async fn get_history(
    state: web::Data<AppState>,
    conversation_id: web::Path<Uuid>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = conversation_id.into_inner();
    let messages = match query.before_seq {
        Some(before_seq) => {
            state
                .messages
                .get_history_before(conversation_id, before_seq, query.limit)
                .await?
        }
        None => {
            state
                .messages
                .get_history(conversation_id, query.after_seq.unwrap_or(0), query.limit)
                .await?
        }
    };
    Ok(HttpResponse::Ok().json(messages))
}

/// POST /conversations/{id}/read
#[post("/conversations/{id}/read")]
pub async fn update_read(
    state: web::Data<AppState>,
    conversation_id: web::Path<Uuid>,
    body: web::Json<ReadRequest>,
) -> Result<HttpResponse, AppError> {
    let advanced = state
        .messages
        .update_read(body.user_id, conversation_id.into_inner(), body.read_seq)
        .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "advanced": advanced })))
}

/// PUT /conversations/{id}/settings
#[put("/conversations/{id}/settings")]
pub async fn update_settings(
    state: web::Data<AppState>,
    conversation_id: web::Path<Uuid>,
    body: web::Json<SettingsRequest>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = conversation_id.into_inner();
    if body.muted.is_none() && body.pinned.is_none() {
        return Err(AppError::BadRequest("nothing to update".into()));
    }
    if let Some(muted) = body.muted {
        state
            .messages
            .set_muted(body.user_id, conversation_id, muted)
            .await?;
    }
    if let Some(pinned) = body.pinned {
        state
            .messages
            .set_pinned(body.user_id, conversation_id, pinned)
            .await?;
    }
    Ok(HttpResponse::NoContent().finish())
}

/// GET /users/{id}/unread
#[get("/users/{id}/unread")]
pub async fn get_unread(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let user_id = user_id.into_inner();
    let total = state.messages.get_total_unread(user_id).await?;
    let conversations = state.sync.unread_conversations(user_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "total": total,
        "conversations": conversations,
    })))
}

/// GET /users/{id}/conversations?limit=
#[get("/users/{id}/conversations")]
pub async fn recent_conversations(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
    query: web::Query<RecentQuery>,
) -> Result<HttpResponse, AppError> {
    let ids = state
        .messages
        .recent_conversations(user_id.into_inner(), query.limit)
        .await?;
    Ok(HttpResponse::Ok().json(ids))
}

/// POST /users/{id}/sync
#[post("/users/{id}/sync")]
pub async fn sync_messages(
    state: web::Data<AppState>,
    user_id: web::Path<Uuid>,
    body: web::Json<SyncRequest>,
) -> Result<HttpResponse, AppError> {
    let cursors: Vec<SyncCursor> = body
        .cursors
        .iter()
        .map(|c| SyncCursor {
            conversation_id: c.conversation_id,
            after_seq: c.after_seq,
        })
        .collect();
    let synced = state
        .sync
        .sync_messages(user_id.into_inner(), &cursors, body.limit)
        .await?;
    Ok(HttpResponse::Ok().json(synced))
}
