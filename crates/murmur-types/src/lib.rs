//! Wire types shared by the Murmur crates.
//!
//! Ids are opaque strings and every timestamp is integer milliseconds since
//! the Unix epoch.

pub mod api;
pub mod events;
pub mod models;
