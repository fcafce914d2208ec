use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// Claims issued by the external identity provider. Shared by the REST
/// middleware and the WebSocket gateway. `sub` is the stable subject id the
/// user directory is keyed on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    pub exp: usize,
}

// -- Users --

/// Profile fields override the matching token claims when present.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPresenceRequest {
    pub is_online: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserSearchQuery {
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LookupUsersRequest {
    pub ids: Vec<String>,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectConversationRequest {
    pub other_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateGroupRequest {
    pub name: Option<String>,
    pub participant_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationIdResponse {
    pub conversation_id: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked: usize,
}

// -- Typing --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetTypingRequest {
    pub is_typing: bool,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToggleReactionResponse {
    pub added: bool,
}
