//! Live delivery for Murmur: a WebSocket gateway that fans core events out
//! to connected clients and turns connection lifecycle into presence.

pub mod connection;
pub mod dispatcher;
