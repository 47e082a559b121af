//! SQLite-backed status store (`~/.exposure-status/status.db`).
//!
//! Timestamps are stored as RFC 3339 text. The whole status is rewritten in
//! one transaction per save.

use std::path::Path;

use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::migrations::run_migrations;
use super::StatusStore;
use crate::error::StoreError;
use crate::types::{NotificationRecord, PersistedStatus, RiskLevel, SourceId, SourceState, Timestamp};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let applied = run_migrations(&conn)?;
        if applied > 0 {
            log::debug!("Status store: applied {} migration(s)", applied);
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ts_to_sql(ts: Option<Timestamp>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn ts_from_sql(field: &'static str, value: Option<String>) -> Result<Option<Timestamp>, StoreError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.to_utc()))
            .map_err(|_| StoreError::Corrupt { field, value: raw }),
    }
}

struct StatusRow {
    level: f64,
    scoring_date: Option<String>,
    last_contact_date: Option<String>,
    last_notified_level: Option<f64>,
    last_notified_at: Option<String>,
    last_refreshed_at: Option<String>,
}

struct SourceRow {
    source: String,
    last_attempt_at: Option<String>,
    last_success_at: Option<String>,
    last_error_at: Option<String>,
    last_result_level: Option<f64>,
    last_result_scoring_date: Option<String>,
    last_result_contact_date: Option<String>,
    last_contact_at: Option<String>,
    next_due_at: Option<String>,
    consecutive_failures: i64,
}

impl SourceRow {
    fn into_state(self) -> Result<(SourceId, SourceState), StoreError> {
        let id = SourceId::parse(&self.source).ok_or(StoreError::Corrupt {
            field: "source_state.source",
            value: self.source.clone(),
        })?;
        let last_result = match self.last_result_level {
            Some(level) => Some(RiskLevel::new(
                level,
                ts_from_sql("source_state.last_result_scoring_date", self.last_result_scoring_date)?,
                ts_from_sql("source_state.last_result_contact_date", self.last_result_contact_date)?,
            )),
            None => None,
        };
        let state = SourceState {
            last_attempt_at: ts_from_sql("source_state.last_attempt_at", self.last_attempt_at)?,
            last_success_at: ts_from_sql("source_state.last_success_at", self.last_success_at)?,
            last_error_at: ts_from_sql("source_state.last_error_at", self.last_error_at)?,
            last_result,
            last_contact_at: ts_from_sql("source_state.last_contact_at", self.last_contact_at)?,
            next_due_at: ts_from_sql("source_state.next_due_at", self.next_due_at)?,
            consecutive_failures: u32::try_from(self.consecutive_failures).unwrap_or(0),
        };
        Ok((id, state))
    }
}

impl StatusStore for SqliteStore {
    fn load(&self) -> Result<Option<PersistedStatus>, StoreError> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT level, scoring_date, last_contact_date, last_notified_level,
                        last_notified_at, last_refreshed_at
                 FROM risk_status WHERE id = 1",
                [],
                |row| {
                    Ok(StatusRow {
                        level: row.get(0)?,
                        scoring_date: row.get(1)?,
                        last_contact_date: row.get(2)?,
                        last_notified_level: row.get(3)?,
                        last_notified_at: row.get(4)?,
                        last_refreshed_at: row.get(5)?,
                    })
                },
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT source, last_attempt_at, last_success_at, last_error_at,
                    last_result_level, last_result_scoring_date, last_result_contact_date,
                    last_contact_at, next_due_at, consecutive_failures
             FROM source_state ORDER BY source",
        )?;
        let source_rows = stmt
            .query_map([], |row| {
                Ok(SourceRow {
                    source: row.get(0)?,
                    last_attempt_at: row.get(1)?,
                    last_success_at: row.get(2)?,
                    last_error_at: row.get(3)?,
                    last_result_level: row.get(4)?,
                    last_result_scoring_date: row.get(5)?,
                    last_result_contact_date: row.get(6)?,
                    last_contact_at: row.get(7)?,
                    next_due_at: row.get(8)?,
                    consecutive_failures: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut status = PersistedStatus {
            current_level: RiskLevel::new(
                row.level,
                ts_from_sql("risk_status.scoring_date", row.scoring_date)?,
                ts_from_sql("risk_status.last_contact_date", row.last_contact_date)?,
            ),
            notification: NotificationRecord {
                last_notified_level: row.last_notified_level,
                last_notified_at: ts_from_sql("risk_status.last_notified_at", row.last_notified_at)?,
            },
            last_refreshed_at: ts_from_sql("risk_status.last_refreshed_at", row.last_refreshed_at)?,
            ..PersistedStatus::default()
        };
        for source_row in source_rows {
            let (id, state) = source_row.into_state()?;
            status.sources.insert(id, state);
        }

        Ok(Some(status))
    }

    fn save(&self, status: &PersistedStatus) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO risk_status (id, level, scoring_date, last_contact_date,
                                      last_notified_level, last_notified_at,
                                      last_refreshed_at, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                level = excluded.level,
                scoring_date = excluded.scoring_date,
                last_contact_date = excluded.last_contact_date,
                last_notified_level = excluded.last_notified_level,
                last_notified_at = excluded.last_notified_at,
                last_refreshed_at = excluded.last_refreshed_at,
                updated_at = excluded.updated_at",
            params![
                status.current_level.level,
                ts_to_sql(status.current_level.scoring_date),
                ts_to_sql(status.current_level.last_contact_date),
                status.notification.last_notified_level,
                ts_to_sql(status.notification.last_notified_at),
                ts_to_sql(status.last_refreshed_at),
            ],
        )?;

        for (id, state) in &status.sources {
            let result = state.last_result.as_ref();
            tx.execute(
                "INSERT INTO source_state (source, last_attempt_at, last_success_at, last_error_at,
                                           last_result_level, last_result_scoring_date,
                                           last_result_contact_date, last_contact_at,
                                           next_due_at, consecutive_failures, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
                 ON CONFLICT(source) DO UPDATE SET
                    last_attempt_at = excluded.last_attempt_at,
                    last_success_at = excluded.last_success_at,
                    last_error_at = excluded.last_error_at,
                    last_result_level = excluded.last_result_level,
                    last_result_scoring_date = excluded.last_result_scoring_date,
                    last_result_contact_date = excluded.last_result_contact_date,
                    last_contact_at = excluded.last_contact_at,
                    next_due_at = excluded.next_due_at,
                    consecutive_failures = excluded.consecutive_failures,
                    updated_at = excluded.updated_at",
                params![
                    id.as_str(),
                    ts_to_sql(state.last_attempt_at),
                    ts_to_sql(state.last_success_at),
                    ts_to_sql(state.last_error_at),
                    result.map(|r| r.level),
                    ts_to_sql(result.and_then(|r| r.scoring_date)),
                    ts_to_sql(result.and_then(|r| r.last_contact_date)),
                    ts_to_sql(state.last_contact_at),
                    ts_to_sql(state.next_due_at),
                    i64::from(state.consecutive_failures),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}
