//! Schema migrations for the SQLite store.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.

use rusqlite::Connection;

use crate::error::StoreError;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/002_source_schedule.sql"),
    },
];

fn ensure_schema_version_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Return the highest applied migration version, or 0 if none.
pub(crate) fn current_version(conn: &Connection) -> Result<i32, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?)
}

/// Back up an already-populated database before touching its schema.
///
/// Creates `<db_path>.pre-migration.bak` with SQLite's online backup API.
fn backup_before_migration(conn: &Connection) -> Result<(), StoreError> {
    let db_path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = Connection::open(&backup_path)?;
    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)?;
    backup.step(-1)?;

    log::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
/// Refuses to open a database written by a newer schema.
pub(crate) fn run_migrations(conn: &Connection) -> Result<usize, StoreError> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if current > max_known {
        return Err(StoreError::Migration(format!(
            "database schema version ({}) is newer than supported ({})",
            current, max_known
        )));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }

    if current > 0 {
        backup_before_migration(conn)?;
    }

    for migration in &pending {
        conn.execute_batch(migration.sql).map_err(|e| {
            StoreError::Migration(format!("v{} failed: {}", migration.version, e))
        })?;
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )?;
        log::info!("Applied status store migration v{}", migration.version);
    }

    Ok(pending.len())
}
