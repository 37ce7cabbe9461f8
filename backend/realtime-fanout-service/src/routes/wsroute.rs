use crate::config::Config;
use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::models::Session;
use crate::state::AppState;
use crate::websocket::{Connected, Gateway};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

// WebSocket Actor
struct WsSession {
    session: Session,
    gateway: Arc<Gateway>,
    intents: mpsc::Sender<String>,
    outbound: Option<mpsc::Receiver<String>>,
    hb: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl WsSession {
    fn new(connected: Connected, gateway: Arc<Gateway>, config: &Config) -> Self {
        Self {
            session: connected.session,
            gateway,
            intents: connected.intents,
            outbound: Some(connected.outbound),
            hb: Instant::now(),
            heartbeat_interval: config.heartbeat_interval,
            client_timeout: config.client_timeout,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.hb) > act.client_timeout {
                tracing::warn!(
                    connection_id = %act.session.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            if act.session.expires_at.is_some_and(|exp| exp <= Utc::now()) {
                tracing::info!(
                    connection_id = %act.session.connection_id,
                    "access token expired, closing session"
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("token expired".into()),
                }));
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.session.connection_id,
            user_id = %self.session.user_id,
            "WebSocket session started"
        );
        self.hb(ctx);
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(ReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            connection_id = %self.session.connection_id,
            user_id = %self.session.user_id,
            "WebSocket session stopped"
        );
        self.gateway.disconnect(self.session.connection_id);
    }
}

// Frames queued by the hub. The stream ends when the hub drops the
// connection (send failure, eviction by the idle sweeper, shutdown).
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::debug!(
            connection_id = %self.session.connection_id,
            "outbound queue closed by hub"
        );
        ctx.close(Some(ws::CloseCode::Away.into()));
        ctx.stop();
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = ?e, "WebSocket protocol error");
                ctx.stop();
                return;
            }
        };

        self.hb = Instant::now();
        self.gateway.touch(self.session.connection_id);

        match msg {
            ws::Message::Ping(msg) => ctx.pong(&msg),
            ws::Message::Pong(_) => {}
            ws::Message::Text(text) => match self.intents.try_send(text.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        connection_id = %self.session.connection_id,
                        "intent queue full, disconnecting"
                    );
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Policy,
                        description: Some("too many pending requests".into()),
                    }));
                    ctx.stop();
                }
                Err(TrySendError::Closed(_)) => ctx.stop(),
            },
            ws::Message::Binary(_) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            ws::Message::Close(reason) => {
                tracing::info!("WebSocket close message received: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => ctx.stop(),
            ws::Message::Nop => {}
        }
    }
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    // Reject non-upgrade requests before doing any work.
    if let Err(e) = ws::handshake(&req) {
        return Err(e.into());
    }

    let credential = query.into_inner().token.or_else(|| bearer_token(&req));
    let connected = state
        .gateway
        .connect(credential.as_deref())
        .await
        .map_err(AppError::from)?;

    let connection_id = connected.session.connection_id;
    let session = WsSession::new(connected, state.gateway.clone(), &state.config);
    let resp = ws::start(session, &req, stream);
    if resp.is_err() {
        state.gateway.disconnect(connection_id);
    }
    resp
}
