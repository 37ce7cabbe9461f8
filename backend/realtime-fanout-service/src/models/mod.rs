pub mod room;
pub mod session;

pub use room::{Room, RoomKind};
pub use session::{ConnectionId, Identity, Session, UserId};
