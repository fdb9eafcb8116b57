//! v001 -- Initial schema creation.
//!
//! Creates the three ledger tables: `messages`, `conversations`, and
//! `sync_state`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    client_id       TEXT PRIMARY KEY NOT NULL,  -- generated locally, never reused
    server_id       INTEGER,                    -- assigned once by the server
    conversation_id TEXT NOT NULL,              -- user_<a>_<b> / group_<g>
    sender_id       INTEGER NOT NULL,
    recipient_id    INTEGER,
    group_id        INTEGER,
    content         TEXT NOT NULL,
    message_type    TEXT NOT NULL,              -- text / image / file
    status          TEXT NOT NULL,              -- pending / sent / delivered / read / failed
    version         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,              -- RFC-3339, millisecond precision, UTC
    updated_at      TEXT NOT NULL,
    is_encrypted    INTEGER NOT NULL DEFAULT 0  -- boolean 0/1
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_server_id
    ON messages(server_id) WHERE server_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages(conversation_id, created_at DESC);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,
    kind            TEXT NOT NULL,              -- direct / group
    participant_ids TEXT NOT NULL,              -- JSON array of user ids
    last_message_id INTEGER,                    -- server id of the newest message
    last_message_at TEXT,
    unread_count    INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
    is_synced       INTEGER NOT NULL DEFAULT 0,
    last_sync_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_last_message
    ON conversations(last_message_at DESC);

-- ----------------------------------------------------------------
-- Sync checkpoints
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_state (
    key             TEXT PRIMARY KEY NOT NULL,  -- last_sync / conversation:<id>
    conversation_id TEXT,
    last_message_id INTEGER,
    last_sync_at    TEXT NOT NULL,
    pending_count   INTEGER NOT NULL DEFAULT 0
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
