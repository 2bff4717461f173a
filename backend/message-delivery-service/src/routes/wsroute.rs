use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::ClientFrame;
use crate::services::{AckService, SessionManager};
use crate::state::AppState;
use crate::websocket::ConnectionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Uuid,
    pub device_id: String,
}

// Frame queued by the delivery router for this connection
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct TextMessage(String);

// Arena slot handed back once on_connect finished
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Attached(ConnectionId);

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Detach;

/// One device's realtime connection.
struct WsSession {
    user_id: Uuid,
    device_id: String,
    connection_id: Option<ConnectionId>,
    sessions: Arc<SessionManager>,
    acks: Arc<AckService>,
    hb: Instant,
}

/// Apply one client frame. Kept outside the actor so it can run on a spawned task.
pub async fn handle_client_frame(
    sessions: &SessionManager,
    acks: &AckService,
    user_id: Uuid,
    device_id: &str,
    frame: ClientFrame,
) -> AppResult<()> {
    match frame {
        ClientFrame::Ack(item) => {
            acks.ack(user_id, item.message_id).await?;
        }
        ClientFrame::BatchAck { items } => {
            let removed = acks.batch_ack(user_id, &items).await?;
            debug!(user_id = %user_id, removed, "Batch ack applied");
        }
        ClientFrame::Heartbeat => {
            sessions.on_heartbeat(user_id, device_id).await?;
        }
    }
    Ok(())
}

impl WsSession {
    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!(user_id = %act.user_id, device_id = %act.device_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn dispatch(&self, frame: ClientFrame) {
        let sessions = self.sessions.clone();
        let acks = self.acks.clone();
        let user_id = self.user_id;
        let device_id = self.device_id.clone();
        actix::spawn(async move {
            if let Err(e) = handle_client_frame(&sessions, &acks, user_id, &device_id, frame).await {
                warn!(user_id = %user_id, error = %e, "Failed to handle client frame");
            }
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);

        let (tx, mut rx) = unbounded_channel::<String>();
        let addr = ctx.address();

        // Forward router frames; a dead actor drops the receiver so the arena prunes the slot
        let forward = addr.clone();
        actix::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if forward.try_send(TextMessage(frame)).is_err() {
                    break;
                }
            }
        });

        let sessions = self.sessions.clone();
        let user_id = self.user_id;
        let device_id = self.device_id.clone();
        actix::spawn(async move {
            match sessions.on_connect(user_id, &device_id, tx).await {
                Ok((connection_id, _)) => addr.do_send(Attached(connection_id)),
                Err(e) => {
                    error!(user_id = %user_id, device_id = %device_id, error = %e, "Session attach failed");
                    addr.do_send(Detach);
                }
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(connection_id) = self.connection_id.take() else {
            return;
        };
        let sessions = self.sessions.clone();
        let user_id = self.user_id;
        let device_id = self.device_id.clone();
        actix::spawn(async move {
            if let Err(e) = sessions.on_disconnect(user_id, &device_id, connection_id).await {
                warn!(user_id = %user_id, device_id = %device_id, error = %e, "Session detach failed");
            }
        });
    }
}

impl Handler<TextMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: TextMessage, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Attached> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Attached, _ctx: &mut Self::Context) {
        self.connection_id = Some(msg.0);
    }
}

impl Handler<Detach> for WsSession {
    type Result = ();

    fn handle(&mut self, _msg: Detach, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if frame == ClientFrame::Heartbeat {
                        self.hb = Instant::now();
                    }
                    self.dispatch(frame);
                }
                Err(e) => warn!(user_id = %self.user_id, error = %e, "Failed to parse client frame"),
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                info!(user_id = %self.user_id, ?reason, "WebSocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Caller identity is asserted by the gateway in front of this service.
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();
    if params.device_id.is_empty() {
        return Ok(HttpResponse::BadRequest().body("device_id is required"));
    }

    let session = WsSession {
        user_id: params.user_id,
        device_id: params.device_id,
        connection_id: None,
        sessions: state.sessions.clone(),
        acks: state.acks.clone(),
        hb: Instant::now(),
    };
    ws::start(session, &req, stream)
}
