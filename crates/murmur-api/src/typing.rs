use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};

use murmur_types::api::SetTypingRequest;
use murmur_types::events::GatewayEvent;

use crate::error::ApiResult;
use crate::middleware::Identity;
use crate::state::AppState;

/// Typing signals from anonymous callers or non-participants are dropped
/// without error.
pub async fn set_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SetTypingRequest>,
) -> ApiResult<StatusCode> {
    let subject = identity.subject();
    let id = conversation_id.clone();
    let applied = state
        .run_db(move |db| {
            let Some(me) = db.find_current_user(subject.as_deref())? else {
                return Ok(None);
            };
            let applied = db.set_typing(&me.id, &id, req.is_typing)?;
            Ok(applied.then_some(me))
        })
        .await?;

    if let Some(user) = applied {
        let event = if req.is_typing {
            GatewayEvent::TypingStart {
                conversation_id,
                user_id: user.id,
                name: user.name,
            }
        } else {
            GatewayEvent::TypingStop {
                conversation_id,
                user_id: user.id,
            }
        };
        state.dispatcher.broadcast(event);
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<String>>> {
    let subject = identity.subject();
    let names = state
        .run_db(move |db| match db.find_current_user(subject.as_deref())? {
            Some(me) => db.get_typing_users(&me.id, &conversation_id),
            None => Ok(Vec::new()),
        })
        .await?;
    Ok(Json(names))
}
