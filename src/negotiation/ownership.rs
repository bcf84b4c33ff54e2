//! Thread ownership registry: which email threads the agent may touch.
//!
//! A thread is agent-managed until a human claims it (via `/claim` or
//! takeover detection) and until someone runs `/resume`. Claim and resume
//! are idempotent, and both are silent: no chat notification accompanies a
//! handoff in either direction.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedBy {
    Agent,
    Human,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadOwnership {
    pub managed_by: ManagedBy,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub struct OwnershipRegistry {
    inner: Arc<RwLock<HashMap<String, ThreadOwnership>>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a thread human-managed. Re-claiming an already claimed thread
    /// keeps the original claimer and timestamp.
    pub fn claim(&self, thread_id: &str, claimer: &str) {
        let mut inner = self.inner.write();
        match inner.get(thread_id) {
            Some(existing) if existing.managed_by == ManagedBy::Human => {}
            _ => {
                inner.insert(
                    thread_id.to_string(),
                    ThreadOwnership {
                        managed_by: ManagedBy::Human,
                        claimed_by: Some(claimer.to_string()),
                        claimed_at: Some(Utc::now()),
                    },
                );
                info!(thread_id, claimer, "thread claimed by human");
            }
        }
    }

    /// Return a thread to the agent. A no-op for threads that are already
    /// agent-managed or unknown.
    pub fn resume(&self, thread_id: &str) {
        let mut inner = self.inner.write();
        match inner.get(thread_id) {
            Some(existing) if existing.managed_by == ManagedBy::Human => {
                inner.insert(
                    thread_id.to_string(),
                    ThreadOwnership {
                        managed_by: ManagedBy::Agent,
                        claimed_by: None,
                        claimed_at: None,
                    },
                );
                info!(thread_id, "thread resumed by agent");
            }
            _ => {}
        }
    }

    pub fn is_human_managed(&self, thread_id: &str) -> bool {
        self.inner
            .read()
            .get(thread_id)
            .map(|o| o.managed_by == ManagedBy::Human)
            .unwrap_or(false)
    }

    pub fn claimed_by(&self, thread_id: &str) -> Option<String> {
        self.inner
            .read()
            .get(thread_id)
            .and_then(|o| o.claimed_by.clone())
    }
}
