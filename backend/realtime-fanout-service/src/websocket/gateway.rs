//! Gateway: handshake, admission and per-connection intent handling.
//!
//! Transport-agnostic. The WebSocket actor in `routes::wsroute` feeds raw
//! text frames into [`Connected::intents`] and drains
//! [`Connected::outbound`]; everything else happens here.

use super::hub::RealtimeHub;
use super::message_types::{ClientIntent, ControlFrame};
use crate::error::RealtimeError;
use crate::metrics;
use crate::middleware::auth::IdentityResolver;
use crate::models::{ConnectionId, Identity, Room, RoomKind, Session};
use crate::services::MembershipStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// An admitted connection, ready to be attached to a transport.
pub struct Connected {
    pub session: Session,
    pub rooms: Vec<Room>,
    pub outbound: mpsc::Receiver<String>,
    /// Raw client text frames. Processed in order by one worker task.
    /// Bounded; a client that fills it gets disconnected.
    pub intents: mpsc::Sender<String>,
}

/// Outcome of a successful handshake.
#[derive(Debug)]
pub struct Handshake {
    pub identity: Identity,
    pub rooms: Vec<Room>,
    /// Revocation mark taken before the membership read.
    pub mark: u64,
}

pub struct Gateway {
    hub: Arc<RealtimeHub>,
    resolver: Arc<dyn IdentityResolver>,
    store: Arc<dyn MembershipStore>,
    handshake_timeout: Duration,
}

impl Gateway {
    pub fn new(
        hub: Arc<RealtimeHub>,
        resolver: Arc<dyn IdentityResolver>,
        store: Arc<dyn MembershipStore>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            hub,
            resolver,
            store,
            handshake_timeout,
        }
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    /// Authenticate and fetch persisted memberships, bounded by the
    /// handshake timeout as a whole.
    pub async fn handshake(&self, credential: Option<&str>) -> Result<Handshake, RealtimeError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RealtimeError::AuthenticationFailure("no credential provided".into()))?;

        let exchange = async {
            let identity = self.resolver.resolve_identity(credential).await?;
            let mark = self.hub.revocation_mark();
            let rooms = self.store.current_rooms(identity.user_id).await?;
            Ok::<_, RealtimeError>(Handshake {
                identity,
                rooms,
                mark,
            })
        };

        tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| RealtimeError::HandshakeTimeout)?
    }

    /// Full connect: handshake, admission, intent worker. On any failure
    /// nothing has been registered.
    pub async fn connect(&self, credential: Option<&str>) -> Result<Connected, RealtimeError> {
        let handshake = self.handshake(credential).await.map_err(|e| {
            metrics::record_handshake_failure(e.code());
            tracing::warn!(error = %e, "websocket handshake refused");
            e
        })?;

        let admission =
            self.hub
                .admit_since(&handshake.identity, handshake.rooms, handshake.mark)?;
        let (intents, rx) = mpsc::channel(self.hub.settings().outbound_buffer);
        let worker = IntentWorker {
            hub: self.hub.clone(),
            store: self.store.clone(),
            session: admission.session.clone(),
            check_timeout: self.handshake_timeout,
        };
        tokio::spawn(worker.run(rx));

        Ok(Connected {
            session: admission.session,
            rooms: admission.rooms,
            outbound: admission.outbound,
            intents,
        })
    }

    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.hub.disconnect(connection_id)
    }

    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        self.hub.touch(connection_id)
    }
}

struct IntentWorker {
    hub: Arc<RealtimeHub>,
    store: Arc<dyn MembershipStore>,
    session: Session,
    check_timeout: Duration,
}

impl IntentWorker {
    async fn run(self, mut rx: mpsc::Receiver<String>) {
        let connection_id = self.session.connection_id;
        while let Some(raw) = rx.recv().await {
            if !self.hub.registry().is_registered(connection_id) {
                break;
            }
            let intent = match serde_json::from_str::<ClientIntent>(&raw) {
                Ok(intent) => intent,
                Err(e) => {
                    self.reject("invalid_intent", format!("unrecognized frame: {e}"), None);
                    continue;
                }
            };
            let room = intent.room();
            let name = intent.name();
            if let Err(e) = self.handle(intent).await {
                tracing::debug!(
                    connection_id = %connection_id,
                    intent = name,
                    error = %e,
                    "intent rejected"
                );
                self.reject(e.code(), e.to_string(), Some(room));
            }
        }
        tracing::debug!(connection_id = %connection_id, "intent worker stopped");
    }

    async fn handle(&self, intent: ClientIntent) -> Result<(), RealtimeError> {
        let connection_id = self.session.connection_id;
        match intent {
            ClientIntent::JoinRoom { room } => self.join(room).await,
            ClientIntent::LeaveRoom { room } => {
                self.require_joined(room)?;
                self.hub.leave_room(connection_id, room);
                self.reply(&ControlFrame::Left { room });
                Ok(())
            }
            ClientIntent::TypingStart { room } => {
                self.require_joined(room)?;
                self.hub.typing_start(&self.session, room);
                Ok(())
            }
            ClientIntent::TypingStop { room } => {
                self.require_joined(room)?;
                self.hub.typing_stop(&self.session, room);
                Ok(())
            }
        }
    }

    async fn join(&self, room: Room) -> Result<(), RealtimeError> {
        let connection_id = self.session.connection_id;
        let user_id = self.session.user_id;

        if !self.hub.rooms().is_member(connection_id, room) {
            let mark = self.hub.revocation_mark();
            let allowed = if room.kind == RoomKind::UserInbox {
                room.is_inbox_of(user_id)
            } else {
                tokio::time::timeout(self.check_timeout, self.store.is_member(user_id, room))
                    .await
                    .map_err(|_| RealtimeError::MembershipStore("membership check timed out".into()))??
            };
            if !allowed {
                return Err(RealtimeError::AuthorizationViolation { room });
            }
            if !self.hub.join_checked(&self.session, room, mark)? {
                // Torn down while we were checking.
                return Ok(());
            }
            tracing::debug!(connection_id = %connection_id, room = %room, "joined room");
        }

        self.reply(&ControlFrame::Joined { room });
        Ok(())
    }

    fn require_joined(&self, room: Room) -> Result<(), RealtimeError> {
        if self.hub.rooms().is_member(self.session.connection_id, room) {
            Ok(())
        } else {
            Err(RealtimeError::AuthorizationViolation { room })
        }
    }

    fn reply(&self, frame: &ControlFrame) {
        self.hub
            .broadcaster()
            .send_control(self.session.connection_id, frame);
    }

    fn reject(&self, code: &str, message: String, room: Option<Room>) {
        metrics::record_intent_rejection(code);
        self.reply(&ControlFrame::error(code, message, room));
    }
}
