// Agent Sessions
//
// Multi-request sessions let an agent group tool calls under one id with
// per-session counters and an optional TTL. Expiry is lazy: a session past
// its TTL flips to expired the next time it is read.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCall {
    pub tool: String,
    pub credits: u64,
    pub timestamp: u64,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub api_key: String,
    pub status: SessionStatus,
    pub calls: Vec<SessionCall>,
    pub total_credits: u64,
    pub total_calls: u64,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionToolUsage {
    pub tool: String,
    pub call_count: u64,
    pub total_credits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_active_sessions: usize,
    /// Applied when a session is created without an explicit TTL.
    pub default_ttl_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 1_000,
            default_ttl_ms: Some(3_600_000),
        }
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    config: SessionConfig,
    clock: SharedClock,
}

impl SessionManager {
    pub fn new(config: SessionConfig, clock: SharedClock) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn create_session(&self, api_key: &str, ttl_ms: Option<u64>) -> Result<Session> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();

        let active = sessions
            .values()
            .filter(|s| Self::live_status(s, now) == SessionStatus::Active)
            .count();
        if active >= self.config.max_active_sessions {
            return Err(GateError::CapacityExceeded(format!(
                "active session limit {} reached",
                self.config.max_active_sessions
            )));
        }

        let ttl = ttl_ms.or(self.config.default_ttl_ms);
        let session = Session {
            id: Uuid::new_v4().to_string(),
            api_key: api_key.to_string(),
            status: SessionStatus::Active,
            calls: Vec::new(),
            total_credits: 0,
            total_calls: 0,
            started_at: now,
            ended_at: None,
            expires_at: ttl.map(|t| now + t),
        };
        sessions.insert(session.id.clone(), session.clone());
        debug!(session = %session.id, "created session");
        Ok(session)
    }

    /// Read a session, lazily transitioning it to expired when its TTL has
    /// passed.
    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id)?;
        Self::expire_if_due(session, now);
        Some(session.clone())
    }

    /// Record one tool call against a session. Ended and expired sessions
    /// reject new calls.
    pub fn record_call(
        &self,
        session_id: &str,
        tool: &str,
        credits: u64,
        metadata: Option<Value>,
    ) -> Result<Session> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GateError::UnknownTask(format!("session {}", session_id)))?;
        Self::expire_if_due(session, now);
        if session.status != SessionStatus::Active {
            return Err(GateError::InvalidState(format!(
                "session is {:?}",
                session.status
            )));
        }

        session.calls.push(SessionCall {
            tool: tool.to_string(),
            credits,
            timestamp: now,
            metadata,
        });
        session.total_calls += 1;
        session.total_credits += credits;
        Ok(session.clone())
    }

    /// End a session. Ending an already-ended or expired session fails.
    pub fn end_session(&self, session_id: &str) -> Result<Session> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GateError::UnknownTask(format!("session {}", session_id)))?;
        Self::expire_if_due(session, now);
        if session.status != SessionStatus::Active {
            return Err(GateError::TaskNotCancellable(format!(
                "session is {:?}",
                session.status
            )));
        }
        session.status = SessionStatus::Ended;
        session.ended_at = Some(now);
        Ok(session.clone())
    }

    /// Per-tool usage aggregate for one session.
    pub fn tool_usage(&self, session_id: &str) -> Result<Vec<SessionToolUsage>> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| GateError::UnknownTask(format!("session {}", session_id)))?;
        let mut by_tool: HashMap<String, SessionToolUsage> = HashMap::new();
        for call in &session.calls {
            let usage = by_tool
                .entry(call.tool.clone())
                .or_insert_with(|| SessionToolUsage {
                    tool: call.tool.clone(),
                    call_count: 0,
                    total_credits: 0,
                });
            usage.call_count += 1;
            usage.total_credits += call.credits;
        }
        let mut report: Vec<SessionToolUsage> = by_tool.into_values().collect();
        report.sort_by(|a, b| b.total_credits.cmp(&a.total_credits));
        Ok(report)
    }

    pub fn list_sessions(&self, api_key: Option<&str>) -> Vec<Session> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        sessions
            .values_mut()
            .map(|s| {
                Self::expire_if_due(s, now);
                s.clone()
            })
            .filter(|s| api_key.map(|k| s.api_key == k).unwrap_or(true))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.sessions
            .read()
            .values()
            .filter(|s| Self::live_status(s, now) == SessionStatus::Active)
            .count()
    }

    /// Drop ended/expired sessions older than the given age.
    pub fn prune(&self, older_than_ms: u64) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(older_than_ms);
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| match Self::live_status(s, now) {
            SessionStatus::Active => true,
            _ => s.ended_at.or(s.expires_at).map(|t| t > cutoff).unwrap_or(false),
        });
        before - sessions.len()
    }

    fn live_status(session: &Session, now: u64) -> SessionStatus {
        if session.status == SessionStatus::Active {
            if let Some(expires) = session.expires_at {
                if now >= expires {
                    return SessionStatus::Expired;
                }
            }
        }
        session.status
    }

    fn expire_if_due(session: &mut Session, now: u64) {
        if session.status == SessionStatus::Active {
            if let Some(expires) = session.expires_at {
                if now >= expires {
                    session.status = SessionStatus::Expired;
                    session.ended_at = Some(expires);
                }
            }
        }
    }
}
