use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        -- Direct and group messages share one table; exactly one of
        -- recipient_id / group_id is set. Ciphertext and iv are paired hex
        -- strings, cleared on soft delete.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_id    TEXT REFERENCES users(id),
            group_id        TEXT REFERENCES groups(id),
            ciphertext      TEXT NOT NULL,
            iv              TEXT NOT NULL,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            deleted_at      TEXT,
            expires_at      TEXT,
            reply_to_id     TEXT REFERENCES messages(id),
            file_url        TEXT,
            file_name       TEXT,
            file_mime       TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL,
            CHECK ((recipient_id IS NULL) != (group_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(sender_id, recipient_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_group
            ON messages(group_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_expiry
            ON messages(expires_at) WHERE expires_at IS NOT NULL;

        -- Presence of a row means the reaction is active; the unique triple
        -- is the synchronization point for concurrent toggles.
        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES groups(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            role        TEXT NOT NULL DEFAULT 'MEMBER',
            joined_at   TEXT NOT NULL,
            UNIQUE(group_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_user
            ON group_members(user_id);

        -- Append-only audit trail; message_id is NULL for sends blocked
        -- before persistence.
        CREATE TABLE IF NOT EXISTS moderation_log (
            id          TEXT PRIMARY KEY,
            message_id  TEXT,
            sender_id   TEXT NOT NULL REFERENCES users(id),
            risk_score  INTEGER NOT NULL,
            analysis    TEXT NOT NULL,
            action      TEXT NOT NULL,
            blocked     INTEGER NOT NULL DEFAULT 0,
            warned      INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_moderation_sender
            ON moderation_log(sender_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
