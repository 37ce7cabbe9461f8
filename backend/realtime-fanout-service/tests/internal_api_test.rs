//! Internal HTTP API, driven through actix's test service.

mod common;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use common::{Harness, INTERNAL_TOKEN};
use realtime_fanout_service::models::Room;
use realtime_fanout_service::routes::configure_routes;
use serde_json::{json, Value};
use uuid::Uuid;

fn bearer() -> (&'static str, String) {
    ("Authorization", format!("Bearer {INTERNAL_TOKEN}"))
}

macro_rules! app {
    ($harness:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($harness.app_state()))
                .configure(configure_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn test_health_and_metrics_are_public() {
    let h = Harness::new();
    let app = app!(h);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_internal_routes_require_token() {
    let h = Harness::new();
    let app = app!(h);

    let req = test::TestRequest::get().uri("/internal/v1/stats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/internal/v1/stats")
        .insert_header(("Authorization", "Bearer wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "unauthorized");
}

#[actix_web::test]
async fn test_publish_room_reaches_members() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let channel = Room::channel(Uuid::new_v4());
    h.store.grant(user, channel);
    let mut client = h.connect(user).await;
    let app = app!(h);

    let req = test::TestRequest::post()
        .uri("/internal/v1/publish/room")
        .insert_header(bearer())
        .set_json(json!({
            "room": channel,
            "type": "new_message",
            "payload": { "id": "m1", "text": "hello" }
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["attempted"], 1);

    let frame = client.next_frame().await;
    assert_eq!(frame["type"], "new_message");
    assert_eq!(frame["room"], json!(channel.to_string()));
    assert_eq!(frame["payload"]["text"], "hello");
}

#[actix_web::test]
async fn test_publish_rejects_server_generated_and_unknown_kinds() {
    let h = Harness::new();
    let app = app!(h);
    let room = Room::channel(Uuid::new_v4());

    for kind in ["user_online", "typing_start"] {
        let req = test::TestRequest::post()
            .uri("/internal/v1/publish/room")
            .insert_header(bearer())
            .set_json(json!({ "room": room, "type": kind, "payload": {} }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{kind}");
    }

    let req = test::TestRequest::post()
        .uri("/internal/v1/publish/room")
        .insert_header(bearer())
        .set_json(json!({ "room": room, "type": "confetti", "payload": {} }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/internal/v1/publish/room")
        .insert_header(bearer())
        .set_json(json!({ "room": "channel:not-a-uuid", "type": "new_message" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_publish_user_reaches_inbox() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let mut client = h.connect(user).await;
    let app = app!(h);

    let req = test::TestRequest::post()
        .uri("/internal/v1/publish/user")
        .insert_header(bearer())
        .set_json(json!({
            "userId": user,
            "type": "all_notifications_read",
            "payload": {}
        }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["attempted"], 1);

    let frame = client.next_frame().await;
    assert_eq!(frame["type"], "all_notifications_read");
    assert_eq!(frame["userId"], json!(user));
}

#[actix_web::test]
async fn test_publish_edit_and_delete_kinds() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let mut client = h.connect(user).await;
    let app = app!(h);

    for kind in [
        "direct_message_updated",
        "direct_message_deleted",
        "thread_reply_updated",
        "thread_reply_deleted",
    ] {
        let req = test::TestRequest::post()
            .uri("/internal/v1/publish/user")
            .insert_header(bearer())
            .set_json(json!({ "userId": user, "type": kind, "payload": { "id": "m1" } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK, "{kind}");
        assert_eq!(client.next_frame().await["type"], kind);
    }
}

#[actix_web::test]
async fn test_membership_revoke_and_grant() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let channel = Room::channel(Uuid::new_v4());
    h.store.grant(user, channel);
    let client = h.connect(user).await;
    let app = app!(h);

    let revoke = || {
        test::TestRequest::post()
            .uri("/internal/v1/memberships/revoke")
            .insert_header(bearer())
            .set_json(json!({ "userId": user, "room": channel }))
            .to_request()
    };

    let body: Value = test::call_and_read_body_json(&app, revoke()).await;
    assert_eq!(body["evicted"], 1);
    assert!(!h.hub.rooms().is_member(client.connection_id(), channel));

    let body: Value = test::call_and_read_body_json(&app, revoke()).await;
    assert_eq!(body["evicted"], 0);

    let req = test::TestRequest::post()
        .uri("/internal/v1/memberships/grant")
        .insert_header(bearer())
        .set_json(json!({ "userId": user, "room": channel }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["joined"], 1);
    assert!(h.hub.rooms().is_member(client.connection_id(), channel));
}

#[actix_web::test]
async fn test_close_room_detaches_everyone() {
    let h = Harness::new();
    let channel = Room::channel(Uuid::new_v4());
    let mut clients = Vec::new();
    for _ in 0..2 {
        let user = Uuid::new_v4();
        h.store.grant(user, channel);
        clients.push(h.connect(user).await);
    }
    let app = app!(h);

    let req = test::TestRequest::post()
        .uri("/internal/v1/rooms/close")
        .insert_header(bearer())
        .set_json(json!({ "room": channel }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["removed"], 2);
    assert!(h.hub.rooms().members_of(channel).is_empty());
    for client in &clients {
        assert!(h.hub.registry().is_registered(client.connection_id()));
    }
}

#[actix_web::test]
async fn test_presence_lookup() {
    let h = Harness::new();
    let user = Uuid::new_v4();
    let _phone = h.connect(user).await;
    let _laptop = h.connect(user).await;
    let app = app!(h);

    let req = test::TestRequest::get()
        .uri(&format!("/internal/v1/presence/{user}"))
        .insert_header(bearer())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["online"], true);
    assert_eq!(body["connections"], 2);
    assert_eq!(body["userId"], json!(user));
    assert_eq!(body["rooms"], json!([Room::user_inbox(user).to_string()]));

    let req = test::TestRequest::get()
        .uri(&format!("/internal/v1/presence/{}", Uuid::new_v4()))
        .insert_header(bearer())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["online"], false);
    assert_eq!(body["connections"], 0);

    let req = test::TestRequest::get()
        .uri("/internal/v1/presence/nobody")
        .insert_header(bearer())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_stats() {
    let h = Harness::new();
    let _a = h.connect(Uuid::new_v4()).await;
    let _b = h.connect(Uuid::new_v4()).await;
    let app = app!(h);

    let req = test::TestRequest::get()
        .uri("/internal/v1/stats")
        .insert_header(bearer())
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["connections"], 2);
    assert_eq!(body["online_users"], 2);
    assert_eq!(body["rooms"], 2);
    assert_eq!(body["shutting_down"], false);
}
