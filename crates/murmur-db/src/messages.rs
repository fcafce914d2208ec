//! Message store: the append-only per-conversation log, read flags,
//! soft deletion and reactions.

use murmur_types::models::Message;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::conversations::require_participant;
use crate::models::{MESSAGE_COLUMNS, MessageRow};
use crate::projection::{group_reactions, reactions_for_conversation, reactions_for_message};
use crate::{ChatError, Database, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageKind {
    User,
    /// Membership and rename notices. Born read.
    System,
}

impl Database {
    /// Append a message from `me` and move the conversation's last-message
    /// pointer to it, in one transaction.
    pub fn send(&self, me: &str, conversation_id: &str, content: &str) -> Result<MessageRow> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content must not be empty".into()));
        }
        let now = self.now();

        self.with_tx(|conn| {
            require_participant(conn, conversation_id, me)?;
            let message = append_message(conn, conversation_id, me, content, MessageKind::User, now)?;
            debug!("{} sent message {} to {}", me, message.id, conversation_id);
            Ok(message)
        })
    }

    /// The whole log of a conversation, oldest first. Not paginated.
    pub fn list_for_conversation(&self, me: &str, conversation_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            require_participant(conn, conversation_id, me)?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at, rowid"
            ))?;
            let rows = stmt
                .query_map([conversation_id], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut reactions = group_reactions(reactions_for_conversation(conn, conversation_id)?);
            let messages = rows
                .into_iter()
                .map(|row| {
                    let groups = reactions.remove(&row.id).unwrap_or_default();
                    row.into_message(groups)
                })
                .collect();
            Ok(messages)
        })
    }

    /// Mark every message not sent by `me` as read. Returns how many flipped;
    /// a repeated call flips nothing.
    pub fn mark_read(&self, me: &str, conversation_id: &str) -> Result<usize> {
        self.with_tx(|conn| {
            require_participant(conn, conversation_id, me)?;
            let marked = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
                [conversation_id, me],
            )?;
            if marked > 0 {
                debug!("{} marked {} messages read in {}", me, marked, conversation_id);
            }
            Ok(marked)
        })
    }

    /// Soft-delete a message. Only its sender may do so; the row stays in
    /// the log.
    pub fn delete_message(&self, me: &str, message_id: &str) -> Result<MessageRow> {
        self.with_tx(|conn| {
            let mut message = load_message(conn, message_id)?
                .ok_or_else(|| ChatError::not_found("message", message_id))?;
            require_participant(conn, &message.conversation_id, me)?;
            if message.is_system {
                return Err(ChatError::InvalidOperation("system messages cannot be deleted".into()));
            }
            if message.sender_id != me {
                return Err(ChatError::PermissionDenied(
                    "only the sender can delete a message".into(),
                ));
            }

            if !message.is_deleted {
                conn.execute("UPDATE messages SET is_deleted = 1 WHERE id = ?1", [message_id])?;
                message.is_deleted = true;
                info!("{} deleted message {}", me, message_id);
            }
            Ok(message)
        })
    }

    /// Toggle `emoji` from `me` on a message: removes it if present, adds it
    /// otherwise. Returns the message and whether the reaction was added.
    pub fn toggle_reaction(
        &self,
        me: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(MessageRow, bool)> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::Validation("emoji must not be empty".into()));
        }
        let now = self.now();

        self.with_tx(|conn| {
            let message = load_message(conn, message_id)?
                .ok_or_else(|| ChatError::not_found("message", message_id))?;
            require_participant(conn, &message.conversation_id, me)?;
            if message.is_deleted {
                return Err(ChatError::InvalidOperation("message was deleted".into()));
            }

            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                [message_id, me, emoji],
            )?;
            if removed > 0 {
                return Ok((message, false));
            }

            conn.execute(
                "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![message_id, me, emoji, now],
            )?;
            Ok((message, true))
        })
    }

    /// A single message in wire form, with its reactions.
    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let Some(row) = load_message(conn, message_id)? else {
                return Ok(None);
            };
            let mut groups = group_reactions(reactions_for_message(conn, message_id)?);
            let reactions = groups.remove(message_id).unwrap_or_default();
            Ok(Some(row.into_message(reactions)))
        })
    }
}

/// Append to a conversation's log and refresh its last-message pointer.
///
/// `created_at` never goes below the newest message already in the log, so
/// ordering by timestamp agrees with insertion order even if the wall clock
/// steps backwards. Must run inside the caller's write transaction.
pub(crate) fn append_message(
    conn: &Connection,
    conversation_id: &str,
    sender_id: &str,
    content: &str,
    kind: MessageKind,
    now: i64,
) -> Result<MessageRow> {
    let latest: Option<i64> = conn.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;

    let is_system = kind == MessageKind::System;
    let message = MessageRow {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        created_at: latest.map_or(now, |t| t.max(now)),
        is_read: is_system,
        is_system,
        is_deleted: false,
    };

    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, created_at, is_read, is_system)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.id,
            message.conversation_id,
            message.sender_id,
            message.content,
            message.created_at,
            message.is_read,
            message.is_system,
        ],
    )?;
    conn.execute(
        "UPDATE conversations SET last_message_id = ?1 WHERE id = ?2",
        params![message.id, conversation_id],
    )?;

    Ok(message)
}

pub(crate) fn load_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            [id],
            MessageRow::from_row,
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use crate::ChatError;
    use crate::test_support::Fixture;

    #[test]
    fn send_appends_and_moves_pointer() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();

        fx.db.send(&ada, &conv, "first").unwrap();
        fx.clock.advance(10);
        let sent = fx.db.send(&grace, &conv, "second").unwrap();

        let log = fx.db.list_for_conversation(&ada, &conv).unwrap();
        assert_eq!(log.len(), 2);
        let last = log.last().unwrap();
        assert_eq!(last.id, sent.id);
        assert_eq!(last.content, "second");
        assert!(!last.is_read);

        let summary = fx.db.get_conversation(&ada, &conv).unwrap();
        assert_eq!(summary.last_message.as_ref(), Some(last));
        assert_eq!(summary.conversation.last_message_id.as_deref(), Some(sent.id.as_str()));
    }

    #[test]
    fn same_timestamp_keeps_insertion_order() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();

        for text in ["one", "two", "three"] {
            fx.db.send(&ada, &conv, text).unwrap();
        }
        // A clock step backwards must not reorder the log.
        fx.clock.advance(-60_000);
        fx.db.send(&ada, &conv, "four").unwrap();

        let log = fx.db.list_for_conversation(&grace, &conv).unwrap();
        let texts: Vec<&str> = log.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three", "four"]);
        assert!(log.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn send_requires_membership_and_content() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let eve = fx.user("Eve");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();

        let err = fx.db.send(&eve, &conv, "hi").unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let err = fx.db.send(&ada, "missing", "hi").unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));

        let err = fx.db.send(&ada, &conv, "   ").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = fx.db.list_for_conversation(&eve, &conv).unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
    }

    #[test]
    fn mark_read_is_idempotent() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();

        fx.db.send(&grace, &conv, "one").unwrap();
        fx.db.send(&grace, &conv, "two").unwrap();
        fx.db.send(&ada, &conv, "mine").unwrap();

        assert_eq!(fx.db.mark_read(&ada, &conv).unwrap(), 2);
        assert_eq!(fx.db.get_conversation(&ada, &conv).unwrap().unread_count, 0);

        assert_eq!(fx.db.mark_read(&ada, &conv).unwrap(), 0);
        assert_eq!(fx.db.get_conversation(&ada, &conv).unwrap().unread_count, 0);

        // Ada's own message is still unread from Grace's side.
        assert_eq!(fx.db.get_conversation(&grace, &conv).unwrap().unread_count, 1);
    }

    #[test]
    fn soft_delete_hides_content() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        let msg = fx.db.send(&ada, &conv, "oops").unwrap();

        let err = fx.db.delete_message(&grace, &msg.id).unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let deleted = fx.db.delete_message(&ada, &msg.id).unwrap();
        assert!(deleted.is_deleted);
        // Deleting twice is harmless.
        fx.db.delete_message(&ada, &msg.id).unwrap();

        let log = fx.db.list_for_conversation(&grace, &conv).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_deleted);
        assert_eq!(log[0].content, "");
        assert_eq!(fx.db.get_conversation(&grace, &conv).unwrap().unread_count, 0);

        let err = fx.db.delete_message(&ada, "missing").unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));
    }

    #[test]
    fn system_messages_cannot_be_deleted() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let group = fx.db.create_group(&a, "G", &[b]).unwrap();
        let notices = fx.db.update_group(&a, &group, Some("G2"), None).unwrap();

        let err = fx.db.delete_message(&a, &notices[0].id).unwrap_err();
        assert!(matches!(err, ChatError::InvalidOperation(_)));
    }

    #[test]
    fn reactions_toggle() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let conv = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        let msg = fx.db.send(&ada, &conv, "hello").unwrap();

        let (_, added) = fx.db.toggle_reaction(&grace, &msg.id, "👍").unwrap();
        assert!(added);
        let (_, added) = fx.db.toggle_reaction(&ada, &msg.id, "👍").unwrap();
        assert!(added);
        fx.db.toggle_reaction(&grace, &msg.id, "🎉").unwrap();

        let message = fx.db.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(message.reactions.len(), 2);
        assert_eq!(message.reactions[0].emoji, "👍");
        assert_eq!(message.reactions[0].count, 2);
        assert_eq!(message.reactions[0].user_ids, vec![grace.clone(), ada.clone()]);

        let (_, added) = fx.db.toggle_reaction(&grace, &msg.id, "👍").unwrap();
        assert!(!added);
        let message = fx.db.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(message.reactions[0].count, 1);

        let err = fx.db.toggle_reaction(&grace, &msg.id, " ").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }
}
