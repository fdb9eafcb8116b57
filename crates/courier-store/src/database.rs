//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. Dropping the handle or
//! calling [`Database::close`] tears the connection down.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;
use crate::models::LedgerStats;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default ledger database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/courier/courier.db`
    /// - macOS:   `~/Library/Application Support/com.courier.courier/courier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\courier\courier\data\courier.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "courier", "courier").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("courier.db");

        tracing::info!(path = %db_path.display(), "opening ledger");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Close the connection, surfacing any error SQLite reports on teardown.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| StoreError::Sqlite(e))
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    ///
    /// Needed to open transactions for the batch helpers.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Row counts for diagnostics.
    pub fn stats(&self) -> Result<LedgerStats> {
        let total_messages: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let pending_messages: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        let conversations: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;

        Ok(LedgerStats {
            total_messages: total_messages as u64,
            pending_messages: pending_messages as u64,
            conversations: conversations as u64,
        })
    }

    /// Wipe messages, conversations and sync checkpoints in one transaction.
    pub fn clear_all_data(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages", [])?;
        tx.execute("DELETE FROM conversations", [])?;
        tx.execute("DELETE FROM sync_state", [])?;
        tx.commit()?;

        tracing::info!("ledger cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());

        let stats = db.stats().unwrap();
        assert_eq!(stats, LedgerStats::default());

        db.close().unwrap();

        // Reopening runs migrations again without error.
        let db = Database::open_at(&path).expect("should reopen");
        db.close().unwrap();
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger").join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(path.exists());
        db.close().unwrap();
    }

    #[test]
    fn clear_all_data_empties_every_table() {
        use chrono::Utc;
        use courier_shared::types::{ConversationId, MessageType, UserId};

        use crate::models::Message;

        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let id = ConversationId::direct(UserId(1), UserId(2));
        let msg = Message::outgoing(id.clone(), UserId(1), Some(UserId(2)), None, "x".into(), MessageType::Text);
        db.record_outgoing(&msg).unwrap();
        db.record_conversation_sync(&id, Some(3), Utc::now()).unwrap();
        db.record_global_sync(Utc::now()).unwrap();

        db.clear_all_data().unwrap();

        assert_eq!(db.stats().unwrap(), LedgerStats::default());
        assert!(db.list_conversations().unwrap().is_empty());
        assert!(db.list_sync_states().unwrap().is_empty());
    }
}
