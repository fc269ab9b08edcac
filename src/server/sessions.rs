//! Agent session table and the idle sweeper.
//!
//! Sessions are keyed by agent id. Any inbound record bearing the agent id
//! touches `last_activity`; a sweeper running every [`SESSION_SWEEP_INTERVAL`]
//! prunes sessions idle longer than [`SESSION_IDLE_LIMIT`].

use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::unix_time_ms;

/// Sessions idle longer than this are pruned.
pub const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(5 * 60);

/// Sweeper cadence.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Idle,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub session_token: String,
    pub agent_name: String,
    pub status: SessionStatus,
    pub last_activity_ms: i64,
    pub created_at_ms: i64,
}

/// In-memory session table plus the global heartbeat timestamp.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, AgentSession>,
    last_heartbeat_ms: Option<i64>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or revive the session for `agent_id` (init and recovery).
    pub fn upsert(&mut self, agent_id: &str) -> &AgentSession {
        let now = unix_time_ms();
        let session = self
            .sessions
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentSession {
                agent_id: agent_id.to_string(),
                session_token: uuid::Uuid::new_v4().to_string(),
                agent_name: agent_id.to_string(),
                status: SessionStatus::Active,
                last_activity_ms: now,
                created_at_ms: now,
            });
        session.status = SessionStatus::Active;
        session.last_activity_ms = now;
        session
    }

    /// Refresh `last_activity` for any inbound record bearing the agent id.
    pub fn touch(&mut self, agent_id: &str) {
        if let Some(session) = self.sessions.get_mut(agent_id) {
            session.last_activity_ms = unix_time_ms();
            session.status = SessionStatus::Active;
        }
    }

    /// Heartbeat: touch the session and record the global heartbeat time.
    pub fn heartbeat(&mut self, agent_id: &str) {
        self.touch(agent_id);
        self.last_heartbeat_ms = Some(unix_time_ms());
    }

    /// Remove the session outright (session_close).
    pub fn close(&mut self, agent_id: &str) -> Option<AgentSession> {
        self.sessions.remove(agent_id)
    }

    /// Mark every session with the given status (extension socket drop).
    pub fn mark_all(&mut self, status: SessionStatus) {
        for session in self.sessions.values_mut() {
            session.status = status;
        }
    }

    /// Prune sessions idle past the limit; returns the pruned agent ids.
    pub fn prune_idle(&mut self, now_ms: i64) -> Vec<String> {
        let limit_ms = SESSION_IDLE_LIMIT.as_millis() as i64;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, session)| now_ms - session.last_activity_ms > limit_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in &expired {
            self.sessions.remove(agent_id);
        }
        expired
    }

    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&AgentSession> {
        self.sessions.get(agent_id)
    }

    #[must_use]
    pub fn last_heartbeat_ms(&self) -> Option<i64> {
        self.last_heartbeat_ms
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_creates_then_revives() {
        let mut table = SessionTable::new();
        let token = table.upsert("agent-a").session_token.clone();

        let revived = table.upsert("agent-a");
        assert_eq!(
            revived.session_token, token,
            "revive must keep the original session token"
        );
        assert_eq!(revived.status, SessionStatus::Active);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_touch_ignores_unknown_agent() {
        let mut table = SessionTable::new();
        table.touch("ghost");
        assert!(table.is_empty(), "touch must not create sessions");
    }

    #[test]
    fn test_heartbeat_records_global_timestamp() {
        let mut table = SessionTable::new();
        table.upsert("agent-a");
        assert!(table.last_heartbeat_ms().is_none());

        table.heartbeat("agent-a");
        assert!(table.last_heartbeat_ms().is_some());
    }

    #[test]
    fn test_prune_idle_removes_only_stale_sessions() {
        let mut table = SessionTable::new();
        table.upsert("agent-fresh");
        table.upsert("agent-stale");

        let idle_ms = SESSION_IDLE_LIMIT.as_millis() as i64;
        let now = unix_time_ms();
        // Backdate one session past the idle limit.
        if let Some(session) = table.sessions.get_mut("agent-stale") {
            session.last_activity_ms = now - idle_ms - 1_000;
        }

        let pruned = table.prune_idle(now);
        assert_eq!(pruned, vec!["agent-stale".to_string()]);
        assert!(table.get("agent-fresh").is_some());
        assert!(table.get("agent-stale").is_none());
    }

    #[test]
    fn test_mark_all_flips_status() {
        let mut table = SessionTable::new();
        table.upsert("agent-a");
        table.upsert("agent-b");
        table.mark_all(SessionStatus::Disconnected);
        assert!(table
            .sessions
            .values()
            .all(|s| s.status == SessionStatus::Disconnected));
    }
}
