//! Typing indicators. Rows expire by timestamp: readers filter on
//! `expires_at > now`, and [`Database::purge_expired_typing`] removes stale
//! rows for storage hygiene only.

use rusqlite::params;
use tracing::debug;

use crate::conversations::is_participant;
use crate::{Database, Result};

/// How long a typing signal stays visible without being refreshed.
pub const TYPING_TTL_MS: i64 = 3_000;

/// Shown for a typing user whose profile cannot be resolved.
pub const UNKNOWN_TYPIST: &str = "Someone";

impl Database {
    /// Start (refresh) or stop `me`'s typing flag in a conversation.
    ///
    /// Best effort: a caller outside the conversation is ignored rather than
    /// rejected. Returns whether anything was recorded.
    pub fn set_typing(&self, me: &str, conversation_id: &str, is_typing: bool) -> Result<bool> {
        let expires_at = self.now() + TYPING_TTL_MS;

        self.with_tx(|conn| {
            if !is_participant(conn, conversation_id, me)? {
                debug!("Ignoring typing signal from {} outside {}", me, conversation_id);
                return Ok(false);
            }

            if is_typing {
                conn.execute(
                    "INSERT INTO typing_status (conversation_id, user_id, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(conversation_id, user_id) DO UPDATE SET expires_at = excluded.expires_at",
                    params![conversation_id, me, expires_at],
                )?;
            } else {
                conn.execute(
                    "DELETE FROM typing_status WHERE conversation_id = ?1 AND user_id = ?2",
                    [conversation_id, me],
                )?;
            }
            Ok(true)
        })
    }

    /// Display names of everyone currently typing in the conversation except
    /// the viewer. Viewers outside the conversation see nobody.
    pub fn get_typing_users(&self, viewer: &str, conversation_id: &str) -> Result<Vec<String>> {
        let now = self.now();

        self.with_conn(|conn| {
            if !is_participant(conn, conversation_id, viewer)? {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(
                "SELECT COALESCE(u.name, ?4) FROM typing_status t
                 LEFT JOIN users u ON u.id = t.user_id
                 WHERE t.conversation_id = ?1 AND t.expires_at > ?2 AND t.user_id != ?3
                 ORDER BY t.expires_at, t.rowid",
            )?;
            let names = stmt
                .query_map(params![conversation_id, now, viewer, UNKNOWN_TYPIST], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    /// Delete typing rows that have already expired. Returns how many went.
    pub fn purge_expired_typing(&self) -> Result<usize> {
        let now = self.now();
        self.with_tx(|conn| {
            let purged = conn.execute("DELETE FROM typing_status WHERE expires_at <= ?1", [now])?;
            Ok(purged)
        })
    }
}
