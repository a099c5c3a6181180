//! Realtime messaging over WebSocket.
//!
//! - [`rooms`]: the in-memory room registry every emit goes through
//! - [`events`]: client and server frame types
//! - [`socket`]: the authenticated `/socket` endpoint and its event loop

pub mod events;
pub mod rooms;
pub mod socket;

pub use events::{ClientEvent, ServerEvent};
pub use rooms::{ConnId, Room, RoomRegistry};
