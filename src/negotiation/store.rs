//! Durable negotiation state store.
//!
//! One sqlite database in WAL mode holds the `negotiation_state` table (this
//! module), the append-only `audit_log` (see [`crate::negotiation::audit`]),
//! and a small `metadata` key/value table for things like the email watch
//! expiration. `save` commits synchronously before returning: nothing
//! observable happens downstream until the row is on disk.

use crate::negotiation::context::NegotiationSnapshot;
use crate::negotiation::state_machine::NegotiationState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Schema for the negotiation side of the database. WAL allows the audit
/// queries and recovery reads to run while a pipeline writes; FULL sync is
/// the durability contract the pipeline's persist-before-send depends on.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS negotiation_state (
    thread_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    round_count INTEGER NOT NULL,
    context_json TEXT NOT NULL,
    campaign_json TEXT NOT NULL,
    cpm_tracker_json TEXT NOT NULL,
    history_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_negotiation_state_state
    ON negotiation_state(state);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    /// A persisted payload no longer matches its schema. Losing state
    /// silently is worse than failing loudly.
    Corrupt {
        thread_id: String,
        detail: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::Corrupt { thread_id, detail } => {
                write!(f, "corrupt negotiation row for thread {thread_id}: {detail}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Corrupt { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// Open (or create) the negotiation database and apply all pragmas.
/// The returned handle is shared with the audit log.
pub fn open_database(path: impl AsRef<Path>) -> Result<Arc<Mutex<Connection>>, StoreError> {
    let conn = Connection::open(path.as_ref())?;
    conn.execute_batch(SCHEMA_SQL)?;
    info!(path = %path.as_ref().display(), "📦 Negotiation database ready");
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database for tests.
pub fn open_in_memory() -> Result<Arc<Mutex<Connection>>, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[derive(Clone)]
pub struct NegotiationStore {
    conn: Arc<Mutex<Connection>>,
}

impl NegotiationStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Upsert the snapshot. On replace the original `created_at` is kept;
    /// everything else reflects the snapshot passed in. The single-statement
    /// upsert commits before this returns.
    pub fn save(&self, snapshot: &NegotiationSnapshot) -> Result<(), StoreError> {
        let context_json = to_json(&snapshot.thread_id, &snapshot.context)?;
        let campaign_json = to_json(&snapshot.thread_id, &snapshot.campaign)?;
        let cpm_tracker_json = to_json(&snapshot.thread_id, &snapshot.cpm_tracker)?;
        let history_json = to_json(&snapshot.thread_id, &snapshot.history)?;

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO negotiation_state (
                thread_id, state, round_count, context_json, campaign_json,
                cpm_tracker_json, history_json, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(thread_id) DO UPDATE SET
                state = excluded.state,
                round_count = excluded.round_count,
                context_json = excluded.context_json,
                campaign_json = excluded.campaign_json,
                cpm_tracker_json = excluded.cpm_tracker_json,
                history_json = excluded.history_json,
                updated_at = excluded.updated_at
            "#,
            params![
                snapshot.thread_id,
                snapshot.state.as_str(),
                snapshot.round_count,
                context_json,
                campaign_json,
                cpm_tracker_json,
                history_json,
                snapshot.created_at.to_rfc3339(),
                snapshot.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All snapshots whose state is non-terminal, for startup recovery.
    pub fn load_active(&self) -> Result<Vec<NegotiationSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT thread_id, state, round_count, context_json, campaign_json,
                   cpm_tracker_json, history_json, created_at, updated_at
            FROM negotiation_state
            WHERE state NOT IN ('agreed', 'rejected')
            ORDER BY created_at ASC
            "#,
        )?;
        let rows = stmt.query_map([], row_to_raw)?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(parse_row(row?)?);
        }
        Ok(snapshots)
    }

    pub fn load(&self, thread_id: &str) -> Result<Option<NegotiationSnapshot>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT thread_id, state, round_count, context_json, campaign_json,
                   cpm_tracker_json, history_json, created_at, updated_at
            FROM negotiation_state
            WHERE thread_id = ?1
            "#,
        )?;
        let mut rows = stmt.query_map(params![thread_id], row_to_raw)?;
        match rows.next() {
            Some(row) => Ok(Some(parse_row(row?)?)),
            None => Ok(None),
        }
    }

    /// Operator cleanup only; nothing in the service calls this. Terminal
    /// rows stay behind as a denormalized outcome record.
    pub fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM negotiation_state WHERE thread_id = ?1",
            params![thread_id],
        )?;
        Ok(affected > 0)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(value) => Ok(Some(value?)),
            None => Ok(None),
        }
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}

struct RawRow {
    thread_id: String,
    state: String,
    round_count: u32,
    context_json: String,
    campaign_json: String,
    cpm_tracker_json: String,
    history_json: String,
    created_at: String,
    updated_at: String,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        thread_id: row.get(0)?,
        state: row.get(1)?,
        round_count: row.get(2)?,
        context_json: row.get(3)?,
        campaign_json: row.get(4)?,
        cpm_tracker_json: row.get(5)?,
        history_json: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn parse_row(raw: RawRow) -> Result<NegotiationSnapshot, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        thread_id: raw.thread_id.clone(),
        detail,
    };

    let state = NegotiationState::from_str(&raw.state).map_err(&corrupt)?;
    let context =
        serde_json::from_str(&raw.context_json).map_err(|e| corrupt(format!("context: {e}")))?;
    let campaign =
        serde_json::from_str(&raw.campaign_json).map_err(|e| corrupt(format!("campaign: {e}")))?;
    let cpm_tracker = serde_json::from_str(&raw.cpm_tracker_json)
        .map_err(|e| corrupt(format!("cpm_tracker: {e}")))?;
    let history =
        serde_json::from_str(&raw.history_json).map_err(|e| corrupt(format!("history: {e}")))?;
    let created_at = parse_timestamp(&raw.created_at).map_err(&corrupt)?;
    let updated_at = parse_timestamp(&raw.updated_at).map_err(&corrupt)?;

    Ok(NegotiationSnapshot {
        thread_id: raw.thread_id,
        state,
        round_count: raw.round_count,
        context,
        campaign,
        cpm_tracker,
        history,
        created_at,
        updated_at,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("timestamp {raw:?}: {e}"))
}

fn to_json<T: serde::Serialize>(thread_id: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        thread_id: thread_id.to_string(),
        detail: format!("serialize: {e}"),
    })
}
