use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: String, name: String },

    /// A message (user or system) was appended to a conversation
    MessageCreate { message: Message },

    /// A message was soft-deleted
    MessageDelete {
        conversation_id: String,
        message_id: String,
    },

    /// A participant marked the conversation as read
    MessagesRead {
        conversation_id: String,
        reader_id: String,
    },

    /// A reaction was added to a message
    ReactionAdd {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },

    /// A reaction was removed from a message
    ReactionRemove {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },

    /// Membership or metadata of a conversation changed; clients refetch it
    ConversationUpdate { conversation_id: String },

    /// A user started typing
    TypingStart {
        conversation_id: String,
        user_id: String,
        name: String,
    },

    /// A user stopped typing
    TypingStop {
        conversation_id: String,
        user_id: String,
    },

    /// A user came online or went offline
    PresenceUpdate {
        user_id: String,
        name: String,
        online: bool,
    },
}

impl GatewayEvent {
    /// Returns the conversation id if this event is scoped to one conversation.
    /// Events that return `None` are global and go to every client.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::MessageCreate { message } => Some(&message.conversation_id),
            Self::MessageDelete { conversation_id, .. }
            | Self::MessagesRead { conversation_id, .. }
            | Self::ReactionAdd { conversation_id, .. }
            | Self::ReactionRemove { conversation_id, .. }
            | Self::ConversationUpdate { conversation_id }
            | Self::TypingStart { conversation_id, .. }
            | Self::TypingStop { conversation_id, .. } => Some(conversation_id),
            Self::Ready { .. } | Self::PresenceUpdate { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Only forward conversation-scoped events for these conversations.
    /// Replaces the previous subscription set.
    Subscribe { conversation_ids: Vec<String> },

    StartTyping { conversation_id: String },

    StopTyping { conversation_id: String },
}
