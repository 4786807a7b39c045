//! Durable store for calls and their recordings (SQLite).
//!
//! The one-recording-per-call invariant is enforced by a `UNIQUE(call_id)`
//! constraint, not by a read-then-write check. Every status transition runs
//! in a single IMMEDIATE transaction together with the row write that
//! triggers it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::recording::{truncate_chars, MAX_TRANSCRIPTION_LEN};
use crate::domain::{
    AnalysisResult, Call, CallPage, CallStatus, CallView, NewCall, Recording, SilenceInterval,
};

/// Errors that can occur in the call store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Call not found: {0}")]
    CallNotFound(Uuid),

    #[error("Recording already exists for call {0}")]
    RecordingExists(Uuid),

    #[error("Recording not found for call {0}")]
    RecordingNotFound(Uuid),

    #[error("Invalid status transition for call {call_id}: {from} → {to}")]
    InvalidTransition {
        call_id: Uuid,
        from: CallStatus,
        to: CallStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// Schema migrations, applied in order; index + 1 is the `user_version`
const MIGRATIONS: &[&str] = &[
    // 1: initial schema
    r#"
    CREATE TABLE call (
        id          TEXT PRIMARY KEY NOT NULL,
        caller      TEXT NOT NULL CHECK (length(caller) <= 32),
        receiver    TEXT NOT NULL CHECK (length(receiver) <= 32),
        started_at  TEXT NOT NULL,
        status      TEXT NOT NULL DEFAULT 'created'
                    CHECK (status IN ('created', 'processing', 'ready')),
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX ix_call_created_at ON call (created_at);

    CREATE TABLE recording (
        id             TEXT PRIMARY KEY NOT NULL,
        call_id        TEXT NOT NULL REFERENCES call (id) ON DELETE CASCADE,
        filename       TEXT NOT NULL CHECK (length(filename) <= 255),
        duration_sec   INTEGER,
        transcription  TEXT,
        created_at     TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    );
    CREATE UNIQUE INDEX ix_recording_call_id ON recording (call_id);
    "#,
    // 2: silence marks (JSON list of {start, end})
    "ALTER TABLE recording ADD COLUMN silence_marks TEXT;",
];

const CALL_COLUMNS: &str = "id, caller, receiver, started_at, status, created_at, updated_at";
const RECORDING_COLUMNS: &str =
    "id, call_id, filename, duration_sec, transcription, silence_marks, created_at, updated_at";

/// SQLite-backed call record store
pub struct CallStore {
    conn: Mutex<Connection>,
}

impl CallStore {
    /// Open (creating if needed) the database at `path` and migrate it
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened call store");
        Ok(store)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrate(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
    }

    /// Insert a new call in `created` status
    pub fn create_call(&self, new: &NewCall) -> Result<Call, StoreError> {
        let now = now();
        let call = Call {
            id: Uuid::new_v4(),
            caller: new.caller.clone(),
            receiver: new.receiver.clone(),
            started_at: new.started_at.trunc_subsecs(6),
            status: CallStatus::Created,
            created_at: now,
            updated_at: now,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO call (id, caller, receiver, started_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                call.id.to_string(),
                call.caller,
                call.receiver,
                ts(call.started_at),
                call.status,
                ts(call.created_at),
                ts(call.updated_at),
            ],
        )?;

        debug!(call_id = %call.id, "Created call");
        Ok(call)
    }

    pub fn get_call(&self, id: Uuid) -> Result<Option<Call>, StoreError> {
        let conn = self.lock()?;
        Ok(select_call(&conn, id)?)
    }

    pub fn get_recording(&self, call_id: Uuid) -> Result<Option<Recording>, StoreError> {
        let conn = self.lock()?;
        Ok(select_recording(&conn, call_id)?)
    }

    /// Call plus its recording, read in one transaction
    pub fn get_call_view(&self, id: Uuid) -> Result<Option<CallView>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let Some(call) = select_call(&tx, id)? else {
            return Ok(None);
        };
        let recording = select_recording(&tx, id)?;
        tx.commit()?;

        Ok(Some(CallView {
            call,
            recording: recording.map(Into::into),
        }))
    }

    /// Substring match on caller or receiver, newest first
    pub fn search_calls(
        &self,
        query: &str,
        limit: u32,
        offset: u64,
    ) -> Result<CallPage, StoreError> {
        let pattern = format!("%{}%", escape_like(query.trim()));

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let total: i64 = tx.query_row(
            r"SELECT COUNT(*) FROM call
              WHERE caller LIKE ?1 ESCAPE '\' OR receiver LIKE ?1 ESCAPE '\'",
            params![pattern],
            |row| row.get(0),
        )?;

        let items = {
            let mut stmt = tx.prepare(&format!(
                r"SELECT {CALL_COLUMNS} FROM call
                  WHERE caller LIKE ?1 ESCAPE '\' OR receiver LIKE ?1 ESCAPE '\'
                  ORDER BY created_at DESC, rowid DESC
                  LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt.query_map(params![pattern, limit, offset as i64], call_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        Ok(CallPage {
            total: total as u64,
            items,
        })
    }

    /// Calls currently in `status`, oldest first
    pub fn calls_with_status(
        &self,
        status: CallStatus,
        limit: u32,
    ) -> Result<Vec<Call>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM call WHERE status = ?1
             ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status, limit], call_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Create the call's recording row and move the call to `processing`.
    ///
    /// A second attempt for the same call fails with
    /// [`StoreError::RecordingExists`] and changes nothing.
    pub fn create_recording(&self, call_id: Uuid, filename: &str) -> Result<Recording, StoreError> {
        let now = now();
        let recording = Recording {
            id: Uuid::new_v4(),
            call_id,
            filename: filename.to_string(),
            duration_sec: None,
            transcription: None,
            silence_marks: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status = select_status(&tx, call_id)?.ok_or(StoreError::CallNotFound(call_id))?;

        let inserted = tx.execute(
            "INSERT INTO recording (id, call_id, filename, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                recording.id.to_string(),
                call_id.to_string(),
                recording.filename,
                ts(now),
                ts(now),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(StoreError::RecordingExists(call_id)),
            Err(e) => return Err(e.into()),
        }

        transition(&tx, call_id, status, CallStatus::Processing, now)?;
        tx.commit()?;

        debug!(%call_id, recording_id = %recording.id, "Recording created, call processing");
        Ok(recording)
    }

    /// Persist analysis results and move the call to `ready`.
    ///
    /// Overwrites any previous results, so a redelivered job can run again.
    pub fn mark_ready(
        &self,
        call_id: Uuid,
        result: &AnalysisResult,
    ) -> Result<Recording, StoreError> {
        let now = now();
        let transcript = truncate_chars(&result.transcript, MAX_TRANSCRIPTION_LEN);
        let silence = serde_json::to_string(&result.silence)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status = select_status(&tx, call_id)?.ok_or(StoreError::CallNotFound(call_id))?;

        let updated = tx.execute(
            "UPDATE recording
             SET duration_sec = ?1, transcription = ?2, silence_marks = ?3, updated_at = ?4
             WHERE call_id = ?5",
            params![result.duration_sec, transcript, silence, ts(now), call_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::RecordingNotFound(call_id));
        }

        transition(&tx, call_id, status, CallStatus::Ready, now)?;

        let recording =
            select_recording(&tx, call_id)?.ok_or(StoreError::RecordingNotFound(call_id))?;
        tx.commit()?;

        debug!(%call_id, duration_sec = result.duration_sec, "Call ready");
        Ok(recording)
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    loop {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let version: i64 = tx.pragma_query_value(None, "user_version", |row| row.get(0))?;
        let Some(sql) = MIGRATIONS.get(version as usize) else {
            return Ok(());
        };

        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        info!(version = version + 1, "Applied schema migration");
    }
}

fn transition(
    conn: &Connection,
    call_id: Uuid,
    from: CallStatus,
    to: CallStatus,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition { call_id, from, to });
    }

    conn.execute(
        "UPDATE call SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![to, ts(now), call_id.to_string()],
    )?;
    Ok(())
}

fn select_status(conn: &Connection, call_id: Uuid) -> rusqlite::Result<Option<CallStatus>> {
    conn.query_row(
        "SELECT status FROM call WHERE id = ?1",
        params![call_id.to_string()],
        |row| row.get(0),
    )
    .optional()
}

fn select_call(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Call>> {
    conn.query_row(
        &format!("SELECT {CALL_COLUMNS} FROM call WHERE id = ?1"),
        params![id.to_string()],
        call_from_row,
    )
    .optional()
}

fn select_recording(conn: &Connection, call_id: Uuid) -> rusqlite::Result<Option<Recording>> {
    conn.query_row(
        &format!("SELECT {RECORDING_COLUMNS} FROM recording WHERE call_id = ?1"),
        params![call_id.to_string()],
        recording_from_row,
    )
    .optional()
}

fn call_from_row(row: &Row<'_>) -> rusqlite::Result<Call> {
    Ok(Call {
        id: uuid_at(row, 0)?,
        caller: row.get(1)?,
        receiver: row.get(2)?,
        started_at: ts_at(row, 3)?,
        status: row.get(4)?,
        created_at: ts_at(row, 5)?,
        updated_at: ts_at(row, 6)?,
    })
}

fn recording_from_row(row: &Row<'_>) -> rusqlite::Result<Recording> {
    let silence_marks = match row.get::<_, Option<String>>(5)? {
        Some(json) => Some(
            serde_json::from_str::<Vec<SilenceInterval>>(&json)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
        ),
        None => None,
    };

    Ok(Recording {
        id: uuid_at(row, 0)?,
        call_id: uuid_at(row, 1)?,
        filename: row.get(2)?,
        duration_sec: row.get(3)?,
        transcription: row.get(4)?,
        silence_marks,
        created_at: ts_at(row, 6)?,
        updated_at: ts_at(row, 7)?,
    })
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Fixed-width UTC timestamps sort lexicographically
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision the store keeps
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

impl ToSql for CallStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CallStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
