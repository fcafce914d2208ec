use axum::{
    Extension, Json,
    extract::{Query, State},
};
use tracing::info;

use murmur_db::ChatError;
use murmur_types::api::{LookupUsersRequest, SetPresenceRequest, SyncProfileRequest, UserSearchQuery};
use murmur_types::events::GatewayEvent;
use murmur_types::models::User;

use crate::error::ApiResult;
use crate::middleware::Identity;
use crate::state::AppState;

/// Create or refresh the caller's profile. Body fields win over the
/// matching token claims.
pub async fn sync_profile(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SyncProfileRequest>,
) -> ApiResult<Json<User>> {
    let claims = identity.claims.ok_or(ChatError::Unauthenticated)?;

    let subject = claims.sub;
    let name = req.name.or(claims.name).unwrap_or_default();
    let email = req.email.or(claims.email).unwrap_or_default();
    let image = req.image.or(claims.picture).unwrap_or_default();

    let user = state
        .run_db(move |db| db.sync_profile(&subject, &name, &email, &image))
        .await?;

    info!("Profile synced for {} ({})", user.name, user.id);
    Ok(Json(user.into()))
}

pub async fn get_me(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<User>> {
    let subject = identity.subject();
    let user = state
        .run_db(move |db| db.resolve_current_user(subject.as_deref()))
        .await?;
    Ok(Json(user.into()))
}

pub async fn set_presence(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SetPresenceRequest>,
) -> ApiResult<Json<User>> {
    let subject = identity.subject();
    let user = state
        .run_db(move |db| {
            let me = db.resolve_current_user(subject.as_deref())?;
            db.set_presence(&me.id, req.is_online)
        })
        .await?;

    state.dispatcher.broadcast(GatewayEvent::PresenceUpdate {
        user_id: user.id.clone(),
        name: user.name.clone(),
        online: user.is_online,
    });

    Ok(Json(user.into()))
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UserSearchQuery>,
) -> ApiResult<Json<Vec<User>>> {
    let subject = identity.subject();
    let users = state
        .run_db(move |db| {
            let Some(me) = db.find_current_user(subject.as_deref())? else {
                return Ok(Vec::new());
            };
            db.list_users(&me.id, query.search.as_deref())
        })
        .await?;

    Ok(Json(users.into_iter().map(User::from).collect()))
}

pub async fn lookup_users(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<LookupUsersRequest>,
) -> ApiResult<Json<Vec<User>>> {
    let subject = identity.subject();
    let users = state
        .run_db(move |db| {
            if db.find_current_user(subject.as_deref())?.is_none() {
                return Ok(Vec::new());
            }
            db.get_users_by_ids(&req.ids)
        })
        .await?;

    Ok(Json(users.into_iter().map(User::from).collect()))
}
