//! HTTP surface of Murmur. Handlers resolve the caller from the bearer
//! token, run the core operation off the async runtime and publish the
//! resulting gateway events.

pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod typing;
pub mod users;

pub use routes::router;
pub use state::{AppState, AppStateInner};
