//! User directory: maps identity-provider subjects to application users and
//! tracks presence.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{USER_COLUMNS, UserRow};
use crate::{ChatError, Database, Result};

/// Stored when the identity provider supplies no usable display name.
pub const DEFAULT_NAME: &str = "Anonymous";

impl Database {
    /// Resolve the caller of a mutation. Fails loudly: no subject is
    /// `Unauthenticated`, an unknown subject is `NotFound`.
    pub fn resolve_current_user(&self, subject: Option<&str>) -> Result<UserRow> {
        let subject = subject.ok_or(ChatError::Unauthenticated)?;
        self.with_conn(|conn| query_user_by_subject(conn, subject))?
            .ok_or_else(|| ChatError::not_found("user", subject))
    }

    /// Tolerant variant of [`Database::resolve_current_user`] for queries,
    /// which answer anonymous or unknown callers with empty results.
    pub fn find_current_user(&self, subject: Option<&str>) -> Result<Option<UserRow>> {
        match subject {
            Some(subject) => self.with_conn(|conn| query_user_by_subject(conn, subject)),
            None => Ok(None),
        }
    }

    /// Upsert the profile for `subject`. Presence fields of an existing user
    /// are left alone.
    pub fn sync_profile(
        &self,
        subject: &str,
        name: &str,
        email: &str,
        image: &str,
    ) -> Result<UserRow> {
        if subject.trim().is_empty() {
            return Err(ChatError::Validation("subject must not be empty".into()));
        }

        let name = match name.trim() {
            "" => DEFAULT_NAME,
            trimmed => trimmed,
        };
        let now = self.now();

        self.with_tx(|conn| {
            conn.execute(
                "INSERT INTO users (id, subject, name, email, image, is_online, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                 ON CONFLICT(subject) DO UPDATE SET
                    name = excluded.name,
                    email = excluded.email,
                    image = excluded.image",
                params![Uuid::new_v4().to_string(), subject, name, email, image, now],
            )?;

            let user = query_user_by_subject(conn, subject)?
                .ok_or_else(|| ChatError::not_found("user", subject))?;
            debug!("Synced profile for {} ({})", user.name, user.id);
            Ok(user)
        })
    }

    /// Set the online flag. `last_seen` is refreshed on every call, online or
    /// offline.
    pub fn set_presence(&self, user_id: &str, is_online: bool) -> Result<UserRow> {
        let now = self.now();

        self.with_tx(|conn| {
            let updated = conn.execute(
                "UPDATE users SET is_online = ?1, last_seen = ?2 WHERE id = ?3",
                params![is_online, now, user_id],
            )?;
            if updated == 0 {
                return Err(ChatError::not_found("user", user_id));
            }

            info!(
                "User {} is now {}",
                user_id,
                if is_online { "online" } else { "offline" }
            );
            query_user_by_id(conn, user_id)?.ok_or_else(|| ChatError::not_found("user", user_id))
        })
    }

    /// Every user except `me`, sorted by name. `search` filters on a
    /// case-insensitive substring of name or email. Folding happens here
    /// rather than in SQL, whose `lower()` only folds ASCII.
    pub fn list_users(&self, me: &str, search: Option<&str>) -> Result<Vec<UserRow>> {
        let needle = search.map(str::trim).unwrap_or_default().to_lowercase();

        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE id != ?1
                 ORDER BY name COLLATE NOCASE, id"
            ))?;

            let rows = stmt
                .query_map([me], UserRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        if needle.is_empty() {
            return Ok(rows);
        }
        Ok(rows
            .into_iter()
            .filter(|u| {
                u.name.to_lowercase().contains(&needle) || u.email.to_lowercase().contains(&needle)
            })
            .collect())
    }

    /// Users for `ids` in input order. Unknown ids are skipped and duplicates
    /// collapsed.
    pub fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut users: Vec<UserRow> = Vec::with_capacity(ids.len());
            for id in ids {
                if users.iter().any(|u| &u.id == id) {
                    continue;
                }
                if let Some(user) = query_user_by_id(conn, id)? {
                    users.push(user);
                }
            }
            Ok(users)
        })
    }
}

pub(crate) fn query_user_by_subject(conn: &Connection, subject: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE subject = ?1"),
            [subject],
            UserRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [id],
            UserRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Display name of an existing user, `NotFound` otherwise.
pub(crate) fn display_name(conn: &Connection, id: &str) -> Result<String> {
    conn.query_row("SELECT name FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?
        .ok_or_else(|| ChatError::not_found("user", id))
}

#[cfg(test)]
mod tests {
    use crate::ChatError;
    use crate::test_support::Fixture;

    #[test]
    fn resolve_requires_identity() {
        let fx = Fixture::new();
        let err = fx.db.resolve_current_user(None).unwrap_err();
        assert!(matches!(err, ChatError::Unauthenticated));

        let err = fx.db.resolve_current_user(Some("nobody")).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { entity: "user", .. }));

        assert!(fx.db.find_current_user(None).unwrap().is_none());
        assert!(fx.db.find_current_user(Some("nobody")).unwrap().is_none());
    }

    #[test]
    fn sync_profile_is_idempotent_and_keeps_presence() {
        let fx = Fixture::new();
        let first = fx.db.sync_profile("sub-1", "Ada", "ada@example.com", "a.png").unwrap();
        fx.db.set_presence(&first.id, true).unwrap();

        fx.clock.advance(5_000);
        let second = fx
            .db
            .sync_profile("sub-1", "Ada Lovelace", "ada@example.com", "b.png")
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Ada Lovelace");
        assert_eq!(second.image, "b.png");
        assert!(second.is_online);
        assert_eq!(second.last_seen, first.last_seen);

        let resolved = fx.db.resolve_current_user(Some("sub-1")).unwrap();
        assert_eq!(resolved, second);
    }

    #[test]
    fn blank_names_become_anonymous() {
        let fx = Fixture::new();
        let user = fx.db.sync_profile("sub-2", "   ", "", "").unwrap();
        assert_eq!(user.name, super::DEFAULT_NAME);

        let err = fx.db.sync_profile(" ", "Ada", "", "").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn presence_refreshes_last_seen() {
        let fx = Fixture::new();
        let id = fx.user("Ada");

        fx.clock.advance(1_000);
        let online = fx.db.set_presence(&id, true).unwrap();
        assert!(online.is_online);
        assert_eq!(online.last_seen, fx.db.now());

        fx.clock.advance(1_000);
        let offline = fx.db.set_presence(&id, false).unwrap();
        assert!(!offline.is_online);
        assert_eq!(offline.last_seen, fx.db.now());

        let err = fx.db.set_presence("missing", true).unwrap_err();
        assert!(matches!(err, ChatError::NotFound { .. }));
    }

    #[test]
    fn list_users_excludes_caller_and_filters() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        fx.user("Grace");
        fx.user("alan");

        let names: Vec<String> = fx
            .db
            .list_users(&ada, None)
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, vec!["alan", "Grace"]);

        let found = fx.db.list_users(&ada, Some("GRA")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Grace");

        let by_email = fx.db.list_users(&ada, Some("alan@")).unwrap();
        assert_eq!(by_email.len(), 1);
    }

    #[test]
    fn search_folds_non_ascii_case() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        fx.db
            .sync_profile("subject|elodie", "Élodie", "elodie@example.com", "")
            .unwrap();
        fx.db
            .sync_profile("subject|sven", "Sven", "ÅSE.sven@example.com", "")
            .unwrap();

        for needle in ["élo", "ÉLO", "Élo", "LODIE"] {
            let found = fx.db.list_users(&ada, Some(needle)).unwrap();
            assert_eq!(found.len(), 1, "search for {needle:?}");
            assert_eq!(found[0].name, "Élodie");
        }

        let by_email = fx.db.list_users(&ada, Some("åse")).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].name, "Sven");
    }

    #[test]
    fn users_by_ids_keeps_order_and_skips_unknown() {
        let fx = Fixture::new();
        let ada = fx.user("Ada");
        let grace = fx.user("Grace");

        let ids = vec![grace.clone(), "missing".to_string(), ada.clone(), grace.clone()];
        let users = fx.db.get_users_by_ids(&ids).unwrap();
        let got: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(got, vec![grace.as_str(), ada.as_str()]);
    }
}
