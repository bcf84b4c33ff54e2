//! Append-only audit trail.
//!
//! One record per material event on a negotiation: email sent, email
//! received, pricing decision, escalation, agreement, human takeover.
//! Lives in the same database as the state store; audit writes always
//! happen after the corresponding state save, never before.

use crate::negotiation::state_machine::NegotiationState;
use crate::negotiation::store::StoreError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Long payloads are stored as a bounded snippet; the full body lives in
/// the email thread itself.
const SNIPPET_MAX_CHARS: usize = 500;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    campaign_id TEXT,
    influencer_name TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    state TEXT NOT NULL,
    payload_snippet TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_audit_campaign_ts
    ON audit_log(campaign_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_audit_influencer_ts
    ON audit_log(influencer_name, timestamp DESC);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Sent,
    Received,
    Decision,
    Escalation,
    Agreement,
    HumanTakeover,
}

impl AuditKind {
    pub const ALL: [AuditKind; 6] = [
        AuditKind::Sent,
        AuditKind::Received,
        AuditKind::Decision,
        AuditKind::Escalation,
        AuditKind::Agreement,
        AuditKind::HumanTakeover,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Sent => "sent",
            AuditKind::Received => "received",
            AuditKind::Decision => "decision",
            AuditKind::Escalation => "escalation",
            AuditKind::Agreement => "agreement",
            AuditKind::HumanTakeover => "human_takeover",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown audit kind: {s:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub campaign_id: Option<String>,
    pub influencer_name: String,
    pub thread_id: String,
    pub state: NegotiationState,
    pub payload_snippet: String,
}

impl AuditEntry {
    pub fn new(
        kind: AuditKind,
        campaign_id: Option<String>,
        influencer_name: impl Into<String>,
        thread_id: impl Into<String>,
        state: NegotiationState,
        payload: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            campaign_id,
            influencer_name: influencer_name.into(),
            thread_id: thread_id.into(),
            state,
            payload_snippet: payload.chars().take(SNIPPET_MAX_CHARS).collect(),
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    /// Applies the audit schema idempotently on the shared database handle.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self, StoreError> {
        conn.lock().execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn record(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO audit_log (
                id, timestamp, kind, campaign_id, influencer_name,
                thread_id, state, payload_snippet
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                entry.id,
                entry.timestamp.to_rfc3339(),
                entry.kind.as_str(),
                entry.campaign_id,
                entry.influencer_name,
                entry.thread_id,
                entry.state.as_str(),
                entry.payload_snippet,
            ],
        )?;
        Ok(())
    }

    pub fn by_influencer(&self, name: &str, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        self.query(
            "SELECT id, timestamp, kind, campaign_id, influencer_name, thread_id, state,
                    payload_snippet
             FROM audit_log WHERE influencer_name = ?1
             ORDER BY timestamp DESC LIMIT ?2",
            params![name, limit],
        )
    }

    pub fn by_campaign(&self, campaign_id: &str, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        self.query(
            "SELECT id, timestamp, kind, campaign_id, influencer_name, thread_id, state,
                    payload_snippet
             FROM audit_log WHERE campaign_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
            params![campaign_id, limit],
        )
    }

    pub fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        self.query(
            "SELECT id, timestamp, kind, campaign_id, influencer_name, thread_id, state,
                    payload_snippet
             FROM audit_log WHERE timestamp >= ?1 AND timestamp < ?2
             ORDER BY timestamp DESC LIMIT ?3",
            params![from.to_rfc3339(), to.to_rfc3339(), limit],
        )
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp, kind, campaign_id, influencer_name, thread_id, state, snippet) =
                row?;
            let corrupt = |detail: String| StoreError::Corrupt {
                thread_id: thread_id.clone(),
                detail,
            };
            entries.push(AuditEntry {
                id,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| corrupt(format!("timestamp: {e}")))?
                    .with_timezone(&Utc),
                kind: AuditKind::from_str(&kind).map_err(&corrupt)?,
                campaign_id,
                influencer_name,
                thread_id: thread_id.clone(),
                state: NegotiationState::from_str(&state).map_err(&corrupt)?,
                payload_snippet: snippet,
            });
        }
        Ok(entries)
    }
}
