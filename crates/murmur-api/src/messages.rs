use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};

use murmur_types::api::{MarkReadResponse, SendMessageRequest, ToggleReactionRequest, ToggleReactionResponse};
use murmur_types::events::GatewayEvent;
use murmur_types::models::Message;

use crate::error::ApiResult;
use crate::middleware::Identity;
use crate::state::AppState;

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let subject = identity.subject();
    let row = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            db.send(&me.id, &conversation_id, &req.content)
        })
        .await?;

    let message = row.into_message(Vec::new());
    state.dispatcher.broadcast(GatewayEvent::MessageCreate {
        message: message.clone(),
    });

    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<Message>>> {
    let subject = identity.subject();
    let messages = state
        .run_db(move |db| match db.find_current_user(subject.as_deref())? {
            Some(me) => db.list_for_conversation(&me.id, &conversation_id),
            None => Ok(Vec::new()),
        })
        .await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<MarkReadResponse>> {
    let subject = identity.subject();
    let id = conversation_id.clone();
    let (reader_id, marked) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let marked = db.mark_read(&me.id, &id)?;
            Ok((me.id, marked))
        })
        .await?;

    if marked > 0 {
        state.dispatcher.broadcast(GatewayEvent::MessagesRead {
            conversation_id,
            reader_id,
        });
    }

    Ok(Json(MarkReadResponse { marked }))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let subject = identity.subject();
    let row = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            db.delete_message(&me.id, &message_id)
        })
        .await?;

    state.dispatcher.broadcast(GatewayEvent::MessageDelete {
        conversation_id: row.conversation_id,
        message_id: row.id,
    });

    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ToggleReactionRequest>,
) -> ApiResult<Json<ToggleReactionResponse>> {
    let subject = identity.subject();
    let emoji = req.emoji.clone();
    let (row, user_id, added) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let (row, added) = db.toggle_reaction(&me.id, &message_id, &emoji)?;
            Ok((row, me.id, added))
        })
        .await?;

    let event = if added {
        GatewayEvent::ReactionAdd {
            conversation_id: row.conversation_id,
            message_id: row.id,
            user_id,
            emoji: req.emoji,
        }
    } else {
        GatewayEvent::ReactionRemove {
            conversation_id: row.conversation_id,
            message_id: row.id,
            user_id,
            emoji: req.emoji,
        }
    };
    state.dispatcher.broadcast(event);

    Ok(Json(ToggleReactionResponse { added }))
}
