//! drawroom relay server library.
//!
//! Exposes the relay server for use in tests and embedding.
//! The relay accepts WebSocket connections, groups them into named rooms,
//! and rebroadcasts drawing and presence messages within each room.

pub mod config;
pub mod relay;
pub mod rooms;
