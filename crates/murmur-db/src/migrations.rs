use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                subject     TEXT NOT NULL UNIQUE,
                name        TEXT NOT NULL,
                email       TEXT NOT NULL DEFAULT '',
                image       TEXT NOT NULL DEFAULT '',
                is_online   INTEGER NOT NULL DEFAULT 0,
                last_seen   INTEGER NOT NULL
            );

            -- pair_key is only set for direct conversations; NULLs never collide.
            CREATE TABLE conversations (
                id              TEXT PRIMARY KEY,
                is_group        INTEGER NOT NULL DEFAULT 0,
                name            TEXT,
                admin_id        TEXT REFERENCES users(id),
                pair_key        TEXT UNIQUE,
                last_message_id TEXT,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                user_id         TEXT NOT NULL REFERENCES users(id),
                joined_at       INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user
                ON conversation_participants(user_id);

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id       TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                is_read         INTEGER NOT NULL DEFAULT 0,
                is_system       INTEGER NOT NULL DEFAULT 0,
                is_deleted      INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at);

            CREATE TABLE reactions (
                message_id  TEXT NOT NULL REFERENCES messages(id),
                user_id     TEXT NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );

            CREATE TABLE typing_status (
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                user_id         TEXT NOT NULL REFERENCES users(id),
                expires_at      INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
