//! Ledger schema migrations, tracked through `PRAGMA user_version`.
//!
//! Step `n` in [`MIGRATIONS`] upgrades the schema from version `n` to
//! `n + 1`. Each step and its version bump commit together.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

/// Bring the schema up to date. Safe to call on every open.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = MIGRATIONS.len() as u32;

    if current > target {
        return Err(StoreError::Migration(format!(
            "ledger schema v{current} is newer than this build (v{target})"
        )));
    }

    for (version, (name, step)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        tracing::info!(migration = name, "upgrading ledger schema");

        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version as u32 + 1)?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_version(conn: &Connection) -> u32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn fresh_schema_reaches_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(user_version(&conn), MIGRATIONS.len() as u32);

        // Second run is a no-op.
        run_migrations(&conn).unwrap();

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'index' AND name = 'idx_messages_conversation_created'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(
            run_migrations(&conn),
            Err(StoreError::Migration(_))
        ));
    }
}
