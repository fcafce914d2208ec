//! Database row types. These map directly to SQLite rows and are kept
//! distinct from the murmur-types wire models.

use murmur_types::models::{Conversation, Message, ReactionGroup, User};
use rusqlite::Row;

pub(crate) const USER_COLUMNS: &str = "id, subject, name, email, image, is_online, last_seen";

pub(crate) const CONVERSATION_COLUMNS: &str =
    "id, is_group, name, admin_id, pair_key, last_message_id, created_at";

pub(crate) const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, created_at, is_read, is_system, is_deleted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: String,
    pub subject: String,
    pub name: String,
    pub email: String,
    pub image: String,
    pub is_online: bool,
    pub last_seen: i64,
}

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            subject: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            image: row.get(4)?,
            is_online: row.get(5)?,
            last_seen: row.get(6)?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            image: row.image,
            is_online: row.is_online,
            last_seen: row.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: String,
    pub is_group: bool,
    pub name: Option<String>,
    pub admin_id: Option<String>,
    pub pair_key: Option<String>,
    pub last_message_id: Option<String>,
    pub created_at: i64,
}

impl ConversationRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            is_group: row.get(1)?,
            name: row.get(2)?,
            admin_id: row.get(3)?,
            pair_key: row.get(4)?,
            last_message_id: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_id.as_deref() == Some(user_id)
    }

    pub(crate) fn into_conversation(self, participants: Vec<String>) -> Conversation {
        Conversation {
            id: self.id,
            participants,
            is_group: self.is_group,
            name: self.name,
            admin_id: self.admin_id,
            last_message_id: self.last_message_id,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: i64,
    pub is_read: bool,
    pub is_system: bool,
    pub is_deleted: bool,
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            is_read: row.get(5)?,
            is_system: row.get(6)?,
            is_deleted: row.get(7)?,
        })
    }

    /// Wire form of the message. Deleted messages lose their content.
    pub fn into_message(self, reactions: Vec<ReactionGroup>) -> Message {
        let content = if self.is_deleted {
            String::new()
        } else {
            self.content
        };

        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content,
            created_at: self.created_at,
            is_read: self.is_read,
            is_system: self.is_system,
            is_deleted: self.is_deleted,
            reactions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRow {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: i64,
}
