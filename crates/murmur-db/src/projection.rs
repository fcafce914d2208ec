//! Read-side projections: per-user conversation summaries and grouped
//! reactions.
//!
//! Unread rule, for direct and group conversations alike: a message counts
//! as unread for `me` when its sender is someone else, its read flag is
//! unset and it has not been deleted. System messages are born read and so
//! never count.

use std::collections::HashMap;

use murmur_types::models::{ConversationSummary, ReactionGroup, User};
use rusqlite::{Connection, params};

use crate::conversations::{is_participant, load_conversation, load_participants};
use crate::messages::load_message;
use crate::models::{CONVERSATION_COLUMNS, ConversationRow, ReactionRow};
use crate::users::query_user_by_id;
use crate::{ChatError, Database, Result};

impl Database {
    /// Every conversation `me` participates in, most recently active first.
    /// Conversations without messages sort last.
    pub fn list_for_user(&self, me: &str) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let columns = CONVERSATION_COLUMNS
                .split(", ")
                .map(|c| format!("c.{c}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT {columns} FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.created_at DESC, c.rowid DESC"
            ))?;
            let rows = stmt
                .query_map([me], ConversationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut summaries = rows
                .into_iter()
                .map(|row| summarize(conn, me, row))
                .collect::<Result<Vec<_>>>()?;

            // Stable sort: equal activity keeps the newest conversation first.
            summaries.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
            Ok(summaries)
        })
    }

    /// Summary of one conversation. Non-members get `NotFound`, the same as
    /// for a conversation that does not exist.
    pub fn get_conversation(&self, me: &str, conversation_id: &str) -> Result<ConversationSummary> {
        self.with_conn(|conn| {
            let row = load_conversation(conn, conversation_id)?
                .ok_or_else(|| ChatError::not_found("conversation", conversation_id))?;
            if !is_participant(conn, conversation_id, me)? {
                return Err(ChatError::not_found("conversation", conversation_id));
            }
            summarize(conn, me, row)
        })
    }
}

fn summarize(conn: &Connection, me: &str, row: ConversationRow) -> Result<ConversationSummary> {
    let participants = load_participants(conn, &row.id)?;

    let other_user = if row.is_group {
        None
    } else {
        match participants.iter().find(|p| p.as_str() != me) {
            Some(other) => query_user_by_id(conn, other)?.map(User::from),
            None => None,
        }
    };

    let last_message = match row.last_message_id.as_deref() {
        Some(message_id) => match load_message(conn, message_id)? {
            Some(message) => {
                let mut groups = group_reactions(reactions_for_message(conn, message_id)?);
                let reactions = groups.remove(message_id).unwrap_or_default();
                Some(message.into_message(reactions))
            }
            None => None,
        },
        None => None,
    };

    let unread_count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0 AND is_deleted = 0",
        params![row.id, me],
        |r| r.get(0),
    )?;

    let member_count = participants.len();
    Ok(ConversationSummary {
        conversation: row.into_conversation(participants),
        other_user,
        last_message,
        unread_count,
        member_count,
    })
}

pub(crate) fn reactions_for_conversation(
    conn: &Connection,
    conversation_id: &str,
) -> Result<Vec<ReactionRow>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.user_id, r.emoji, r.created_at
         FROM reactions r
         JOIN messages m ON m.id = r.message_id
         WHERE m.conversation_id = ?1
         ORDER BY r.created_at, r.rowid",
    )?;
    let rows = stmt
        .query_map([conversation_id], reaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn reactions_for_message(conn: &Connection, message_id: &str) -> Result<Vec<ReactionRow>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, user_id, emoji, created_at FROM reactions
         WHERE message_id = ?1
         ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map([message_id], reaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn reaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReactionRow> {
    Ok(ReactionRow {
        message_id: row.get(0)?,
        user_id: row.get(1)?,
        emoji: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Group reaction rows by message, then by emoji in order of first use.
pub(crate) fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<String, Vec<ReactionGroup>> {
    let mut by_message: HashMap<String, Vec<ReactionGroup>> = HashMap::new();
    for r in rows {
        let groups = by_message.entry(r.message_id).or_default();
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(r.user_id);
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji,
                count: 1,
                user_ids: vec![r.user_id],
            }),
        }
    }
    by_message
}

#[cfg(test)]
mod tests {
    use crate::ChatError;
    use crate::test_support::Fixture;

    #[test]
    fn list_orders_by_last_activity() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let alan = fx.user("Alan");

        let with_grace = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        fx.clock.advance(1);
        let with_alan = fx.db.get_or_create_direct(&ada, &alan).unwrap();
        fx.clock.advance(1);
        let quiet = fx.db.create_group(&ada, "Quiet", &[grace.clone(), alan.clone()]).unwrap();

        fx.clock.advance(1);
        fx.db.send(&alan, &with_alan, "old").unwrap();
        fx.clock.advance(1);
        fx.db.send(&grace, &with_grace, "new").unwrap();

        let ids: Vec<String> = fx
            .db
            .list_for_user(&ada)
            .unwrap()
            .into_iter()
            .map(|s| s.conversation.id)
            .collect();
        assert_eq!(ids, vec![with_grace, with_alan, quiet]);
    }

    #[test]
    fn summaries_resolve_other_party_and_unread() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let alan = fx.user("Alan");

        let direct = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        fx.db.send(&grace, &direct, "hi").unwrap();
        fx.db.send(&grace, &direct, "there").unwrap();

        let group = fx.db.create_group(&ada, "G", &[grace.clone(), alan.clone()]).unwrap();
        fx.db.send(&grace, &group, "from grace").unwrap();
        fx.db.send(&alan, &group, "from alan").unwrap();
        fx.db.update_group(&ada, &group, Some("G2"), None).unwrap();

        let summaries = fx.db.list_for_user(&ada).unwrap();
        let direct_summary = summaries.iter().find(|s| s.conversation.id == direct).unwrap();
        assert_eq!(direct_summary.other_user.as_ref().map(|u| u.name.as_str()), Some("Grace"));
        assert_eq!(direct_summary.unread_count, 2);
        assert_eq!(direct_summary.member_count, 2);

        let group_summary = summaries.iter().find(|s| s.conversation.id == group).unwrap();
        assert!(group_summary.other_user.is_none());
        // Unread from any other sender; the rename notice is born read.
        assert_eq!(group_summary.unread_count, 2);
        assert_eq!(group_summary.member_count, 3);
        let last = group_summary.last_message.as_ref().unwrap();
        assert!(last.is_system);
        assert_eq!(group_summary.conversation.name.as_deref(), Some("G2"));
        assert_eq!(group_summary.conversation.admin_id.as_deref(), Some(ada.as_str()));
    }

    #[test]
    fn list_only_includes_own_conversations() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let eve = fx.user("Eve");

        let direct = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        assert!(fx.db.list_for_user(&eve).unwrap().is_empty());

        let err = fx.db.get_conversation(&eve, &direct).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));

        let summary = fx.db.get_conversation(&grace, &direct).unwrap();
        assert!(summary.last_message.is_none());
        assert_eq!(summary.other_user.unwrap().id, ada);
    }

    #[test]
    fn removed_member_loses_the_conversation() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let c = fx.user("C");
        let group = fx.db.create_group(&a, "G", &[b.clone(), c.clone()]).unwrap();
        assert_eq!(fx.db.list_for_user(&b).unwrap().len(), 1);

        fx.db.update_group(&a, &group, None, Some(&[c][..])).unwrap();
        assert!(fx.db.list_for_user(&b).unwrap().is_empty());
    }
}
