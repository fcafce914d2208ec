//! Conversation engine: membership, direct-vs-group semantics, admin
//! authority and the system messages that record membership changes.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::messages::{MessageKind, append_message};
use crate::models::{CONVERSATION_COLUMNS, ConversationRow, MessageRow};
use crate::users::{display_name, query_user_by_id};
use crate::{ChatError, Database, Result};

/// Lookup key of a direct conversation: both ids in sorted order, so the key
/// is the same whichever side starts the conversation.
pub fn pair_key(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

/// Union of `me` and `ids`, deduplicated, with `me` first.
fn member_set(me: &str, ids: &[String]) -> Vec<String> {
    let mut members = vec![me.to_string()];
    for id in ids {
        if !members.contains(id) {
            members.push(id.clone());
        }
    }
    members
}

fn validate_group_name(name: &str) -> Result<&str> {
    match name.trim() {
        "" => Err(ChatError::Validation("group name must not be empty".into())),
        trimmed => Ok(trimmed),
    }
}

fn require_group_size(members: &[String]) -> Result<()> {
    if members.len() < 2 {
        return Err(ChatError::Validation(
            "a group needs at least one participant besides the admin".into(),
        ));
    }
    Ok(())
}

impl Database {
    /// Return the direct conversation between `me` and `other`, creating it
    /// on first contact. At most one exists per unordered pair.
    pub fn get_or_create_direct(&self, me: &str, other: &str) -> Result<String> {
        if me == other {
            return Err(ChatError::Validation(
                "cannot start a direct conversation with yourself".into(),
            ));
        }

        let key = pair_key(me, other);
        let now = self.now();

        self.with_tx(|conn| {
            if query_user_by_id(conn, other)?.is_none() {
                return Err(ChatError::not_found("user", other));
            }

            if let Some(id) = conversation_id_by_pair(conn, &key)? {
                return Ok(id);
            }

            let (id, created) = insert_direct_row(conn, &key, now)?;
            if !created {
                return Ok(id);
            }

            let (lo, hi) = if me <= other { (me, other) } else { (other, me) };
            insert_participant(conn, &id, lo, now)?;
            insert_participant(conn, &id, hi, now)?;

            info!("Created direct conversation {} between {} and {}", id, lo, hi);
            Ok(id)
        })
    }

    /// Create a group administered by `me`. Participants are the union of
    /// `participant_ids` and `me`.
    pub fn create_group(&self, me: &str, name: &str, participant_ids: &[String]) -> Result<String> {
        let name = validate_group_name(name)?;
        let members = member_set(me, participant_ids);
        require_group_size(&members)?;
        let now = self.now();

        self.with_tx(|conn| {
            for member in &members {
                if query_user_by_id(conn, member)?.is_none() {
                    return Err(ChatError::not_found("user", member.as_str()));
                }
            }

            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO conversations (id, is_group, name, admin_id, created_at)
                 VALUES (?1, 1, ?2, ?3, ?4)",
                params![id, name, me, now],
            )?;
            for member in &members {
                insert_participant(conn, &id, member, now)?;
            }

            info!("Created group {} '{}' with {} members", id, name, members.len());
            Ok(id)
        })
    }

    /// Rename a group and/or replace its membership. Admin only. Returns the
    /// system messages appended, in order: rename, additions, removals.
    pub fn update_group(
        &self,
        me: &str,
        conversation_id: &str,
        name: Option<&str>,
        participant_ids: Option<&[String]>,
    ) -> Result<Vec<MessageRow>> {
        let now = self.now();

        self.with_tx(|conn| {
            let conversation = load_conversation(conn, conversation_id)?
                .ok_or_else(|| ChatError::not_found("conversation", conversation_id))?;
            if !conversation.is_group {
                return Err(ChatError::InvalidOperation("not a group conversation".into()));
            }
            if !conversation.is_admin(me) {
                return Err(ChatError::PermissionDenied(
                    "only the admin can update the group".into(),
                ));
            }

            let actor = display_name(conn, me)?;
            let mut notices = Vec::new();

            if let Some(name) = name {
                let name = validate_group_name(name)?;
                if conversation.name.as_deref() != Some(name) {
                    conn.execute(
                        "UPDATE conversations SET name = ?1 WHERE id = ?2",
                        params![name, conversation_id],
                    )?;
                    let text = format!("{actor} changed the group name to \"{name}\"");
                    notices.push(append_message(
                        conn,
                        conversation_id,
                        me,
                        &text,
                        MessageKind::System,
                        now,
                    )?);
                }
            }

            if let Some(ids) = participant_ids {
                let next = member_set(me, ids);
                require_group_size(&next)?;
                let current = load_participants(conn, conversation_id)?;

                for user in next.iter().filter(|u| !current.contains(u)) {
                    let added = display_name(conn, user)?;
                    insert_participant(conn, conversation_id, user, now)?;
                    let text = format!("{actor} added {added}");
                    notices.push(append_message(
                        conn,
                        conversation_id,
                        me,
                        &text,
                        MessageKind::System,
                        now,
                    )?);
                }

                for user in current.iter().filter(|u| !next.contains(u)) {
                    let removed = display_name(conn, user)?;
                    remove_participant(conn, conversation_id, user)?;
                    let text = format!("{actor} removed {removed}");
                    notices.push(append_message(
                        conn,
                        conversation_id,
                        me,
                        &text,
                        MessageKind::System,
                        now,
                    )?);
                }
            }

            info!(
                "Group {} updated by {} ({} notices)",
                conversation_id,
                me,
                notices.len()
            );
            Ok(notices)
        })
    }

    /// Leave a group. The admin can never leave: there is no admin transfer.
    pub fn leave_group(&self, me: &str, conversation_id: &str) -> Result<MessageRow> {
        let now = self.now();

        self.with_tx(|conn| {
            let conversation = load_conversation(conn, conversation_id)?
                .ok_or_else(|| ChatError::not_found("conversation", conversation_id))?;
            if !conversation.is_group {
                return Err(ChatError::InvalidOperation("not a group conversation".into()));
            }
            if !is_participant(conn, conversation_id, me)? {
                return Err(ChatError::not_found("participant", me));
            }
            if conversation.is_admin(me) {
                return Err(ChatError::PermissionDenied("admin cannot leave the group".into()));
            }

            let actor = display_name(conn, me)?;
            remove_participant(conn, conversation_id, me)?;
            let notice = append_message(
                conn,
                conversation_id,
                me,
                &format!("{actor} left the group"),
                MessageKind::System,
                now,
            )?;

            info!("{} left group {}", me, conversation_id);
            Ok(notice)
        })
    }

    /// Participant ids of a conversation, in join order.
    pub fn participants(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| load_participants(conn, conversation_id))
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| is_participant(conn, conversation_id, user_id))
    }
}

/// Insert the conversation row for `key`. If another writer already holds
/// the pair, returns its id with `false` instead.
fn insert_direct_row(conn: &Connection, key: &str, now: i64) -> Result<(String, bool)> {
    let id = Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO conversations (id, is_group, pair_key, created_at)
         VALUES (?1, 0, ?2, ?3)
         ON CONFLICT(pair_key) DO NOTHING",
        params![id, key, now],
    )?;

    if inserted == 0 {
        debug!("Direct conversation {} already created concurrently", key);
        let existing = conversation_id_by_pair(conn, key)?
            .ok_or_else(|| ChatError::not_found("conversation", key))?;
        return Ok((existing, false));
    }
    Ok((id, true))
}

pub(crate) fn load_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            [id],
            ConversationRow::from_row,
        )
        .optional()?;
    Ok(row)
}

fn conversation_id_by_pair(conn: &Connection, key: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM conversations WHERE pair_key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn load_participants(conn: &Connection, conversation_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants
         WHERE conversation_id = ?1
         ORDER BY joined_at, rowid",
    )?;
    let ids = stmt
        .query_map([conversation_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub(crate) fn is_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
            [conversation_id, user_id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Load a conversation the caller belongs to. Missing conversations are
/// `NotFound`, non-members are `PermissionDenied`.
pub(crate) fn require_participant(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<ConversationRow> {
    let conversation = load_conversation(conn, conversation_id)?
        .ok_or_else(|| ChatError::not_found("conversation", conversation_id))?;
    if !is_participant(conn, conversation_id, user_id)? {
        return Err(ChatError::PermissionDenied(
            "not a participant of this conversation".into(),
        ));
    }
    Ok(conversation)
}

fn insert_participant(conn: &Connection, conversation_id: &str, user_id: &str, now: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
         VALUES (?1, ?2, ?3)",
        params![conversation_id, user_id, now],
    )?;
    Ok(())
}

/// Drop a member along with their typing flag for the conversation.
fn remove_participant(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id, user_id],
    )?;
    conn.execute(
        "DELETE FROM typing_status WHERE conversation_id = ?1 AND user_id = ?2",
        [conversation_id, user_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    fn contents(fx: &Fixture, me: &str, conversation_id: &str) -> Vec<String> {
        fx.db
            .list_for_conversation(me, conversation_id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("b", "a"), pair_key("a", "b"));
        assert_eq!(pair_key("a", "b"), "a:b");
    }

    #[test]
    fn direct_conversation_is_unique_per_pair() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");

        let first = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        let second = fx.db.get_or_create_direct(&grace, &ada).unwrap();
        let third = fx.db.get_or_create_direct(&ada, &grace).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);

        let count: i64 = fx
            .db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 1);

        let participants = fx.db.participants(&first).unwrap();
        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&ada) && participants.contains(&grace));
    }

    #[test]
    fn concurrent_first_contact_creates_one_conversation() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let db = &fx.db;

        let ids: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let (me, other) = if i % 2 == 0 { (&ada, &grace) } else { (&grace, &ada) };
                    s.spawn(move || db.get_or_create_direct(me, other).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn losing_pair_insert_returns_existing_id() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");
        let existing = fx.db.get_or_create_direct(&ada, &grace).unwrap();

        let key = pair_key(&ada, &grace);
        let (id, created) = fx
            .db
            .with_tx(|conn| insert_direct_row(conn, &key, fx.db.now()))
            .unwrap();
        assert!(!created);
        assert_eq!(id, existing);
        assert_eq!(fx.db.participants(&existing).unwrap().len(), 2);
    }

    #[test]
    fn direct_conversation_rejects_self_and_unknown_users() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");

        let err = fx.db.get_or_create_direct(&ada, &ada).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = fx.db.get_or_create_direct(&ada, "ghost").unwrap_err();
        assert!(matches!(err, ChatError::NotFound { entity: "user", .. }));
    }

    #[test]
    fn create_group_adds_admin_and_dedupes() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");

        let id = fx
            .db
            .create_group(&ada, "Team", &[grace.clone(), grace.clone(), ada.clone()])
            .unwrap();
        let participants = fx.db.participants(&id).unwrap();
        assert_eq!(participants, vec![ada.clone(), grace.clone()]);

        let again = fx.db.create_group(&ada, "Team", &[grace.clone()]).unwrap();
        assert_ne!(id, again);
    }

    #[test]
    fn create_group_validates_input() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");

        let err = fx.db.create_group(&ada, "  ", &[grace.clone()]).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = fx.db.create_group(&ada, "Solo", &[]).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = fx.db.create_group(&ada, "Ghosts", &["ghost".into()]).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));
    }

    #[test]
    fn trio_scenario() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let c = fx.user("C");

        let trio = fx.db.create_group(&a, "Trio", &[b.clone(), c.clone()]).unwrap();
        assert_eq!(fx.db.participants(&trio).unwrap(), vec![a.clone(), b.clone(), c.clone()]);

        let notices = fx.db.update_group(&a, &trio, Some("Trio2"), None).unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].content, "A changed the group name to \"Trio2\"");
        assert!(notices[0].is_system && notices[0].is_read);

        let notices = fx
            .db
            .update_group(&a, &trio, None, Some(&[c.clone()][..]))
            .unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].content, "A removed B");
        assert_eq!(notices[0].sender_id, a);
        assert_eq!(fx.db.participants(&trio).unwrap(), vec![a.clone(), c.clone()]);

        let err = fx.db.leave_group(&b, &trio).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { entity: "participant", .. }));
    }

    #[test]
    fn unchanged_name_adds_no_notice() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let group = fx.db.create_group(&a, "Same", &[b.clone()]).unwrap();

        let notices = fx.db.update_group(&a, &group, Some("Same"), None).unwrap();
        assert!(notices.is_empty());

        let err = fx.db.update_group(&a, &group, Some(" "), None).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn add_then_remove_produces_two_notices_in_order() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let x = fx.user("X");
        let group = fx.db.create_group(&a, "G", &[b.clone()]).unwrap();

        fx.db
            .update_group(&a, &group, None, Some(&[b.clone(), x.clone()][..]))
            .unwrap();
        fx.db.update_group(&a, &group, None, Some(&[b.clone()][..])).unwrap();

        let mentions: Vec<String> = contents(&fx, &a, &group)
            .into_iter()
            .filter(|c| c.ends_with(" X"))
            .collect();
        assert_eq!(mentions, vec!["A added X", "A removed X"]);
    }

    #[test]
    fn admin_is_always_retained() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let c = fx.user("C");
        let group = fx.db.create_group(&a, "G", &[b.clone()]).unwrap();

        // Admin omitted from the new list.
        fx.db.update_group(&a, &group, None, Some(&[c.clone()][..])).unwrap();
        let participants = fx.db.participants(&group).unwrap();
        assert!(participants.contains(&a));
        assert!(participants.contains(&c));
        assert!(!participants.contains(&b));

        let err = fx.db.update_group(&a, &group, None, Some(&[][..])).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert_eq!(fx.db.participants(&group).unwrap(), participants);
    }

    #[test]
    fn update_group_checks_kind_and_authority() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let direct = fx.db.get_or_create_direct(&a, &b).unwrap();
        let group = fx.db.create_group(&a, "G", &[b.clone()]).unwrap();

        let err = fx.db.update_group(&a, "missing", Some("x"), None).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));

        let err = fx.db.update_group(&a, &direct, Some("x"), None).unwrap_err();
        assert!(matches!(err, ChatError::InvalidOperation(_)));

        let err = fx.db.update_group(&b, &group, Some("x"), None).unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
    }

    #[test]
    fn admin_cannot_leave() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let group = fx.db.create_group(&a, "G", &[b.clone()]).unwrap();

        let err = fx.db.leave_group(&a, &group).unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
        assert_eq!(fx.db.participants(&group).unwrap(), vec![a.clone(), b.clone()]);
        assert!(contents(&fx, &a, &group).is_empty());
    }

    #[test]
    fn member_leaves_with_notice() {
        let fx = Fixture::new();
        let a = fx.user("A");
        let b = fx.user("B");
        let c = fx.user("C");
        let group = fx.db.create_group(&a, "G", &[b.clone(), c.clone()]).unwrap();
        let direct = fx.db.get_or_create_direct(&a, &b).unwrap();

        let notice = fx.db.leave_group(&b, &group).unwrap();
        assert_eq!(notice.content, "B left the group");
        assert!(notice.is_system && notice.is_read);
        assert!(!fx.db.is_participant(&group, &b).unwrap());

        let err = fx.db.leave_group(&a, &direct).unwrap_err();
        assert!(matches!(err, ChatError::InvalidOperation(_)));
    }
}
