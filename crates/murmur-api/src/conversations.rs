use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::info;

use murmur_db::models::MessageRow;
use murmur_types::api::{
    ConversationIdResponse, CreateGroupRequest, DirectConversationRequest, UpdateGroupRequest,
};
use murmur_types::events::GatewayEvent;
use murmur_types::models::{ConversationSummary, Message};

use crate::error::ApiResult;
use crate::middleware::Identity;
use crate::state::AppState;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let subject = identity.subject();
    let summaries = state
        .run_db(move |db| match db.find_current_user(subject.as_deref())? {
            Some(me) => db.list_for_user(&me.id),
            None => Ok(Vec::new()),
        })
        .await?;
    Ok(Json(summaries))
}

/// Anonymous callers get `null`.
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Option<ConversationSummary>>> {
    let subject = identity.subject();
    let summary = state
        .run_db(move |db| match db.find_current_user(subject.as_deref())? {
            Some(me) => db.get_conversation(&me.id, &conversation_id).map(Some),
            None => Ok(None),
        })
        .await?;
    Ok(Json(summary))
}

pub async fn open_direct(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<DirectConversationRequest>,
) -> ApiResult<Json<ConversationIdResponse>> {
    let subject = identity.subject();
    let (conversation_id, members) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let id = db.get_or_create_direct(&me.id, &req.other_user_id)?;
            let members = db.participants(&id)?;
            Ok((id, members))
        })
        .await?;

    state
        .dispatcher
        .send_to_users(
            &members,
            GatewayEvent::ConversationUpdate {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;

    Ok(Json(ConversationIdResponse { conversation_id }))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<ConversationIdResponse>)> {
    let subject = identity.subject();
    let (conversation_id, members) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let id = db.create_group(&me.id, &req.name, &req.participant_ids)?;
            let members = db.participants(&id)?;
            Ok((id, members))
        })
        .await?;

    info!("Group {} created with {} members", conversation_id, members.len());

    state
        .dispatcher
        .send_to_users(
            &members,
            GatewayEvent::ConversationUpdate {
                conversation_id: conversation_id.clone(),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(ConversationIdResponse { conversation_id })))
}

/// Rename and/or re-member a group. Old and new members are both told to
/// refetch, so removed users drop the conversation from their lists.
/// Removed users stop receiving its live events before the notices go out.
pub async fn update_group(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<UpdateGroupRequest>,
) -> ApiResult<Json<Vec<Message>>> {
    let subject = identity.subject();
    let id = conversation_id.clone();
    let (notices, before, after) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let before = db.participants(&id)?;
            let notices = db.update_group(
                &me.id,
                &id,
                req.name.as_deref(),
                req.participant_ids.as_deref(),
            )?;
            let after = db.participants(&id)?;
            Ok((notices, before, after))
        })
        .await?;

    let removed: Vec<String> = before
        .iter()
        .filter(|id| !after.contains(id))
        .cloned()
        .collect();
    state
        .dispatcher
        .revoke_subscription(&removed, &conversation_id)
        .await;

    let messages = publish_notices(&state, notices);

    let mut affected = after;
    affected.extend(removed);
    state
        .dispatcher
        .send_to_users(&affected, GatewayEvent::ConversationUpdate { conversation_id })
        .await;

    Ok(Json(messages))
}

pub async fn leave_group(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let subject = identity.subject();
    let id = conversation_id.clone();
    let (notice, me, remaining) = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            let notice = db.leave_group(&me.id, &id)?;
            let remaining = db.participants(&id)?;
            Ok((notice, me.id, remaining))
        })
        .await?;

    let leaver = vec![me];
    state
        .dispatcher
        .revoke_subscription(&leaver, &conversation_id)
        .await;

    publish_notices(&state, vec![notice]);

    let mut affected = remaining;
    affected.extend(leaver);
    state
        .dispatcher
        .send_to_users(&affected, GatewayEvent::ConversationUpdate { conversation_id })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Broadcast freshly appended system messages and return their wire form.
fn publish_notices(state: &AppState, notices: Vec<MessageRow>) -> Vec<Message> {
    notices
        .into_iter()
        .map(|row| {
            let message = row.into_message(Vec::new());
            state.dispatcher.broadcast(GatewayEvent::MessageCreate {
                message: message.clone(),
            });
            message
        })
        .collect()
}
