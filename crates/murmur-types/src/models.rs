use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub image: String,
    pub is_online: bool,
    pub last_seen: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Participant ids in the order they joined.
    pub participants: Vec<String>,
    pub is_group: bool,
    pub name: Option<String>,
    pub admin_id: Option<String>,
    pub last_message_id: Option<String>,
    pub created_at: i64,
}

/// A message as seen by clients. Deleted messages keep their place in the
/// log but carry an empty `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: i64,
    pub is_read: bool,
    pub is_system: bool,
    pub is_deleted: bool,
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<String>,
}

/// Per-user view of a conversation used by the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// The other participant of a direct conversation. Always `None` for groups.
    pub other_user: Option<User>,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub member_count: usize,
}

impl ConversationSummary {
    /// Sort key for the conversation list: conversations without messages
    /// count as timestamp 0.
    pub fn last_activity(&self) -> i64 {
        self.last_message.as_ref().map_or(0, |m| m.created_at)
    }
}
