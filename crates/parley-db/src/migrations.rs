use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Mirror of the platform's identities, refreshed on every handshake
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY,
            username    TEXT NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_username
            ON users(username COLLATE NOCASE);

        -- One row per unordered pair: user_low < user_high
        CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_low    INTEGER NOT NULL REFERENCES users(id),
            user_high   INTEGER NOT NULL REFERENCES users(id),
            created_at  INTEGER NOT NULL,
            CHECK (user_low < user_high),
            UNIQUE (user_low, user_high)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_high
            ON conversations(user_high);

        -- created_at is microseconds since the epoch, non-decreasing per conversation
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            attachment_ref  TEXT,
            is_system       INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);

        CREATE TABLE IF NOT EXISTS read_cursors (
            conversation_id      INTEGER NOT NULL REFERENCES conversations(id),
            user_id              INTEGER NOT NULL REFERENCES users(id),
            last_read_message_id INTEGER NOT NULL DEFAULT 0,
            updated_at           INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            user_id     INTEGER NOT NULL REFERENCES users(id),
            read_at     INTEGER NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
