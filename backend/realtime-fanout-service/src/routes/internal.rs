//! Internal API for write-path collaborators.
//!
//! Controllers call these after a database write has committed. Nothing here
//! touches the database.

use crate::error::{AppError, AppResult};
use crate::middleware::auth::require_internal_token;
use crate::models::{Room, UserId};
use crate::state::AppState;
use crate::websocket::{EventKind, EvictionOutcome};
use actix_web::dev::Payload;
use actix_web::{get, post, web, FromRequest, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::{ready, Ready};

/// Extractor that admits only callers holding the internal API token.
pub struct InternalCaller;

impl FromRequest for InternalCaller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let expected = req
            .app_data::<web::Data<AppState>>()
            .and_then(|state| state.config.internal_api_token.clone());
        ready(require_internal_token(req, expected.as_deref()).map(|_| InternalCaller))
    }
}

#[derive(Debug, Deserialize)]
pub struct RoomPublishRequest {
    pub room: Room,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublishRequest {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRequest {
    pub user_id: UserId,
    pub room: Room,
}

#[derive(Debug, Deserialize)]
pub struct CloseRoomRequest {
    pub room: Room,
}

fn ensure_publishable(kind: EventKind) -> AppResult<()> {
    if kind.is_server_generated() {
        return Err(AppError::BadRequest(format!(
            "{} is generated by the realtime service",
            kind.as_str()
        )));
    }
    Ok(())
}

#[post("/publish/room")]
pub async fn publish_room(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    body: web::Json<RoomPublishRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    ensure_publishable(body.kind)?;
    let attempted = state
        .hub
        .broadcaster()
        .publish(body.room, body.kind, body.payload);
    Ok(HttpResponse::Ok().json(json!({ "attempted": attempted })))
}

#[post("/publish/user")]
pub async fn publish_user(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    body: web::Json<UserPublishRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    ensure_publishable(body.kind)?;
    let attempted = state
        .hub
        .broadcaster()
        .publish_to_user(body.user_id, body.kind, body.payload);
    Ok(HttpResponse::Ok().json(json!({ "attempted": attempted })))
}

/// Persisted membership deleted: evict the user's live connections.
#[post("/memberships/revoke")]
pub async fn revoke_membership(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    body: web::Json<MembershipRequest>,
) -> AppResult<HttpResponse> {
    let evicted = match state.hub.evict_membership(body.user_id, body.room) {
        EvictionOutcome::Evicted(n) => n,
        EvictionOutcome::NoLiveMembership => 0,
    };
    Ok(HttpResponse::Ok().json(json!({ "evicted": evicted })))
}

/// Persisted membership created: join the user's live connections.
#[post("/memberships/grant")]
pub async fn grant_membership(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    body: web::Json<MembershipRequest>,
) -> AppResult<HttpResponse> {
    let joined = state.hub.grant_membership(body.user_id, body.room);
    Ok(HttpResponse::Ok().json(json!({ "joined": joined })))
}

#[post("/rooms/close")]
pub async fn close_room(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    body: web::Json<CloseRoomRequest>,
) -> AppResult<HttpResponse> {
    let removed = state.hub.close_room(body.room);
    Ok(HttpResponse::Ok().json(json!({ "removed": removed })))
}

#[get("/presence/{user_id}")]
pub async fn presence(
    _caller: InternalCaller,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let user_id = UserId::parse_str(&path.into_inner())
        .map_err(|_| AppError::BadRequest("invalid user id".into()))?;
    let connections = state.hub.registry().connections_for(user_id).len();
    let mut rooms: Vec<Room> = state.hub.rooms_of_user(user_id).into_iter().collect();
    rooms.sort();
    Ok(HttpResponse::Ok().json(json!({
        "userId": user_id,
        "online": connections > 0,
        "connections": connections,
        "rooms": rooms,
    })))
}

#[get("/stats")]
pub async fn stats(_caller: InternalCaller, state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.hub.stats())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/internal/v1")
            .service(publish_room)
            .service(publish_user)
            .service(revoke_membership)
            .service(grant_membership)
            .service(close_room)
            .service(presence)
            .service(stats),
    );
}
