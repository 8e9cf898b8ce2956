//! Registry of connected agent sessions, keyed by user.
//!
//! The map is the only path from a user id to a live session, so a
//! request can never be dispatched to another user's agent. Tier caps
//! are enforced at registration time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use homelink_proto::Message;

use crate::auth::{unix_now, Identity, Tier};
use crate::metrics::{METRIC_CONNECTIONS_ACTIVE, METRIC_CONNECTIONS_BY_TIER};

/// Handle to one live agent session, shared between the registry, the
/// proxy front, and the session task itself.
pub struct AgentHandle {
    pub session_id: Uuid,
    pub user_id: String,
    pub tier: Tier,
    /// Data channel into the session's writer task.
    pub frames: mpsc::Sender<Message>,
    /// Outstanding tunnel requests on this session.
    pub pending: AtomicUsize,
    /// Set while the session refuses new dispatches (shutdown drain).
    pub draining: AtomicBool,
    /// Unix seconds, for diagnostics.
    pub connected_at: u64,
    /// Token expiry carried by the session's identity, unix seconds.
    pub token_expires_at: u64,
}

impl AgentHandle {
    pub fn new(identity: &Identity, frames: mpsc::Sender<Message>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id: identity.user_id.clone(),
            tier: identity.tier,
            frames,
            pending: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            connected_at: unix_now(),
            token_expires_at: identity.expires_at,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session limit reached for tier {tier} (cap {cap})")]
    SessionLimit { tier: Tier, cap: usize },
}

struct UserSessions {
    sessions: Vec<Arc<AgentHandle>>,
    /// Round-robin cursor for `resolve`.
    cursor: AtomicUsize,
}

#[derive(Default)]
pub struct AgentRegistry {
    users: DashMap<String, UserSessions>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, enforcing the tier's concurrent-session cap.
    pub fn register(&self, handle: Arc<AgentHandle>) -> Result<(), RegistryError> {
        let cap = handle.tier.session_cap();
        let mut entry = self
            .users
            .entry(handle.user_id.clone())
            .or_insert_with(|| UserSessions {
                sessions: Vec::with_capacity(1),
                cursor: AtomicUsize::new(0),
            });
        if entry.sessions.len() >= cap {
            return Err(RegistryError::SessionLimit {
                tier: handle.tier,
                cap,
            });
        }
        metrics::gauge!(METRIC_CONNECTIONS_ACTIVE).increment(1.0);
        metrics::gauge!(METRIC_CONNECTIONS_BY_TIER, "tier" => handle.tier.as_str()).increment(1.0);
        entry.sessions.push(handle);
        Ok(())
    }

    /// Pick a live session for `user_id`, round-robin across sessions.
    pub fn resolve(&self, user_id: &str) -> Option<Arc<AgentHandle>> {
        let entry = self.users.get(user_id)?;
        let n = entry.sessions.len();
        if n == 0 {
            return None;
        }
        let idx = entry.cursor.fetch_add(1, Ordering::Relaxed) % n;
        Some(Arc::clone(&entry.sessions[idx]))
    }

    /// Remove one session; drops the user entry when it was the last.
    pub fn unregister(&self, user_id: &str, session_id: Uuid) {
        let mut removed_tier = None;
        if let Some(mut entry) = self.users.get_mut(user_id) {
            if let Some(pos) = entry
                .sessions
                .iter()
                .position(|s| s.session_id == session_id)
            {
                removed_tier = Some(entry.sessions.remove(pos).tier);
            }
        }
        self.users
            .remove_if(user_id, |_, sessions| sessions.sessions.is_empty());
        if let Some(tier) = removed_tier {
            metrics::gauge!(METRIC_CONNECTIONS_ACTIVE).decrement(1.0);
            metrics::gauge!(METRIC_CONNECTIONS_BY_TIER, "tier" => tier.as_str()).decrement(1.0);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.users.iter().map(|e| e.sessions.len()).sum()
    }

    /// Diagnostics view of every live session.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.users
            .iter()
            .flat_map(|e| {
                e.sessions
                    .iter()
                    .map(|s| SessionInfo {
                        session_id: s.session_id.to_string(),
                        user_id: s.user_id.clone(),
                        tier: s.tier.as_str(),
                        pending: s.pending.load(Ordering::Relaxed),
                        connected_at: s.connected_at,
                        token_expires_at: s.token_expires_at,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub tier: &'static str,
    pub pending: usize,
    pub connected_at: u64,
    pub token_expires_at: u64,
}
