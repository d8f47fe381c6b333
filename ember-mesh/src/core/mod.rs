//! Core primitives shared by every layer.

pub mod ids;

pub use ids::{EntityId, PeerId, RoomCode, RoomCodeError};
