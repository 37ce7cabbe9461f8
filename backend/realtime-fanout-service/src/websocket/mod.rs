//! Real-time fan-out core.
//!
//! Leaf first: [`registry`] (who is connected), [`rooms`] (who is in which
//! room), [`presence`] (online/offline/typing), [`broadcast`] (delivery),
//! [`hub`] (the context object tying them together) and [`gateway`]
//! (handshake and client intents).

pub mod broadcast;
pub mod events;
pub mod gateway;
pub mod hub;
pub mod message_types;
pub mod presence;
pub mod registry;
pub mod rooms;

pub use broadcast::Broadcaster;
pub use events::{EventEnvelope, EventKind, EventScope};
pub use gateway::{Connected, Gateway, Handshake};
pub use hub::{Admission, EvictionOutcome, HubSettings, HubStats, RealtimeHub};
pub use message_types::{ClientIntent, ControlFrame};
pub use presence::PresenceTracker;
pub use registry::{ConnectionRegistry, PresenceObserver};
pub use rooms::{JoinOutcome, RoomMembership};
