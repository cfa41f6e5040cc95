//! Room management and routing

pub mod rooms;

pub use rooms::{Intent, RoomError, RoomManager, RouteError};
