//! Fakes and helpers shared by the integration tests.
//!
//! The identity resolver and membership store are in-memory stand-ins for
//! the JWT verifier and Postgres, so the gateway can be driven end to end
//! without external services.
#![allow(dead_code)]

use async_trait::async_trait;
use realtime_fanout_service::config::Config;
use realtime_fanout_service::error::RealtimeError;
use realtime_fanout_service::middleware::auth::IdentityResolver;
use realtime_fanout_service::models::{Identity, Room, UserId};
use realtime_fanout_service::services::MembershipStore;
use realtime_fanout_service::state::AppState;
use realtime_fanout_service::websocket::{Connected, Gateway, HubSettings, RealtimeHub};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

pub const INTERNAL_TOKEN: &str = "internal-test-token";

/// Accepts tokens of the form `token-<uuid>`.
#[derive(Default)]
pub struct MockIdentityResolver {
    delay: Mutex<Option<Duration>>,
}

impl MockIdentityResolver {
    pub fn token_for(user_id: UserId) -> String {
        format!("token-{user_id}")
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn resolve_identity(&self, credential: &str) -> Result<Identity, RealtimeError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        credential
            .strip_prefix("token-")
            .and_then(|raw| UserId::parse_str(raw).ok())
            .map(Identity::new)
            .ok_or_else(|| RealtimeError::AuthenticationFailure("unknown token".into()))
    }
}

/// Persisted memberships, keyed by user.
///
/// The delays are applied after the answer is read, which models a slow
/// round trip whose result is already stale when it arrives.
#[derive(Default)]
pub struct MockMembershipStore {
    rooms: Mutex<HashMap<UserId, HashSet<Room>>>,
    unavailable: Mutex<bool>,
    rooms_delay: Mutex<Option<Duration>>,
    check_delay: Mutex<Option<Duration>>,
}

impl MockMembershipStore {
    pub fn grant(&self, user_id: UserId, room: Room) {
        self.rooms
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .insert(room);
    }

    pub fn revoke(&self, user_id: UserId, room: Room) {
        if let Some(rooms) = self.rooms.lock().unwrap().get_mut(&user_id) {
            rooms.remove(&room);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    pub fn set_rooms_delay(&self, delay: Duration) {
        *self.rooms_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_check_delay(&self, delay: Duration) {
        *self.check_delay.lock().unwrap() = Some(delay);
    }

    fn check_available(&self) -> Result<(), RealtimeError> {
        if *self.unavailable.lock().unwrap() {
            return Err(RealtimeError::MembershipStore("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for MockMembershipStore {
    async fn current_rooms(&self, user_id: UserId) -> Result<Vec<Room>, RealtimeError> {
        self.check_available()?;
        let snapshot: Vec<Room> = self
            .rooms
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        let delay = *self.rooms_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn is_member(&self, user_id: UserId, room: Room) -> Result<bool, RealtimeError> {
        self.check_available()?;
        let member = self
            .rooms
            .lock()
            .unwrap()
            .get(&user_id)
            .is_some_and(|r| r.contains(&room));
        let delay = *self.check_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(member)
    }
}

pub struct Harness {
    pub hub: Arc<RealtimeHub>,
    pub gateway: Arc<Gateway>,
    pub resolver: Arc<MockIdentityResolver>,
    pub store: Arc<MockMembershipStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(HubSettings::default(), Duration::from_millis(500))
    }

    pub fn with_settings(settings: HubSettings, handshake_timeout: Duration) -> Self {
        let hub = Arc::new(RealtimeHub::new(settings));
        let resolver = Arc::new(MockIdentityResolver::default());
        let store = Arc::new(MockMembershipStore::default());
        let gateway = Arc::new(Gateway::new(
            hub.clone(),
            resolver.clone(),
            store.clone(),
            handshake_timeout,
        ));
        Self {
            hub,
            gateway,
            resolver,
            store,
        }
    }

    /// Connect `user_id` and consume its `ready` frame.
    pub async fn connect(&self, user_id: UserId) -> Client {
        let token = MockIdentityResolver::token_for(user_id);
        let connected = self
            .gateway
            .connect(Some(&token))
            .await
            .expect("connect should succeed");
        let mut client = Client { connected };
        let ready = client.next_frame().await;
        assert_eq!(ready["type"], "ready");
        client
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            hub: self.hub.clone(),
            gateway: self.gateway.clone(),
            config: Arc::new(test_config()),
        }
    }
}

/// The test side of one connection: what the socket actor would see.
pub struct Client {
    pub connected: Connected,
}

impl Client {
    pub fn connection_id(&self) -> realtime_fanout_service::models::ConnectionId {
        self.connected.session.connection_id
    }

    pub fn send(&self, intent: Value) {
        self.connected
            .intents
            .try_send(intent.to_string())
            .expect("intent queue has room");
    }

    pub fn join(&self, room: Room) {
        self.send(json!({ "type": "join_room", "room": room }));
    }

    pub async fn next_frame(&mut self) -> Value {
        let raw = timeout(Duration::from_secs(2), self.connected.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound stream closed");
        serde_json::from_str(&raw).expect("frame is json")
    }

    /// Skip frames until one of the given type arrives.
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    pub async fn expect_silence(&mut self) {
        let res = timeout(Duration::from_millis(100), self.connected.outbound.recv()).await;
        assert!(res.is_err(), "unexpected frame: {:?}", res);
    }

    /// True once the hub has dropped this connection's sender.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(Duration::from_secs(2), self.connected.outbound.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/realtime_test".into(),
        port: 0,
        db_max_connections: 1,
        jwt_public_key_pem: String::new(),
        jwt_audience: None,
        jwt_issuer: None,
        handshake_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_secs(5),
        client_timeout: Duration::from_secs(30),
        idle_sweep_interval: Duration::from_secs(30),
        typing_timeout: Duration::from_secs(5),
        outbound_buffer: 256,
        internal_api_token: Some(INTERNAL_TOKEN.into()),
    }
}
