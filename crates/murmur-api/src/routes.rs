use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::middleware::identify;
use crate::state::AppState;
use crate::{conversations, messages, typing, users};

/// REST routes. The WebSocket gateway is mounted by the server binary.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let api_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/users/sync", post(users::sync_profile))
        .route("/users/me", get(users::get_me))
        .route("/users/me/presence", post(users::set_presence))
        .route("/users/lookup", post(users::lookup_users))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/direct", post(conversations::open_direct))
        .route("/conversations/groups", post(conversations::create_group))
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation).patch(conversations::update_group),
        )
        .route("/conversations/{conversation_id}/leave", post(conversations::leave_group))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{conversation_id}/read", post(messages::mark_read))
        .route(
            "/conversations/{conversation_id}/typing",
            get(typing::get_typing).put(typing::set_typing),
        )
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route("/messages/{message_id}/reactions", post(messages::toggle_reaction))
        .layer(middleware::from_fn_with_state(state.clone(), identify));

    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
