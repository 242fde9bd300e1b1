// Connection Billing
//
// Long-lived streaming sessions are billed per elapsed interval instead of
// per call. A grace period at session start is free, idle sessions and
// sessions past the duration cap are flagged for termination, and a session
// is never partially charged: if the key cannot cover the owed intervals
// the bill reports `insufficient_credits` with no charge.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub const TERMINATE_IDLE: &str = "idle_timeout";
pub const TERMINATE_MAX_DURATION: &str = "max_duration";
pub const TERMINATE_INSUFFICIENT: &str = "insufficient_credits";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionBillingConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub credits_per_interval: u64,
    pub grace_period_seconds: u64,
    /// Zero disables the idle check.
    pub idle_timeout_seconds: u64,
    /// Zero disables the duration cap.
    pub max_duration_seconds: u64,
    /// Only sessions on these transports are billed.
    pub billed_transports: Vec<String>,
}

impl Default for ConnectionBillingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            credits_per_interval: 1,
            grace_period_seconds: 60,
            idle_timeout_seconds: 300,
            max_duration_seconds: 0,
            billed_transports: vec!["sse".to_string(), "websocket".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSession {
    pub session_id: String,
    pub api_key: String,
    pub transport: String,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub last_activity_at: u64,
    pub intervals_billed: u64,
    pub credits_billed: u64,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionBillResult {
    pub session_id: String,
    pub credits_charged: u64,
    pub should_terminate: bool,
    pub terminate_reason: Option<String>,
    pub duration_seconds: u64,
}

impl ConnectionBillResult {
    fn noop(session_id: &str, duration_seconds: u64) -> Self {
        Self {
            session_id: session_id.to_string(),
            credits_charged: 0,
            should_terminate: false,
            terminate_reason: None,
            duration_seconds,
        }
    }

    fn terminate(session_id: &str, duration_seconds: u64, reason: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            credits_charged: 0,
            should_terminate: true,
            terminate_reason: Some(reason.to_string()),
            duration_seconds,
        }
    }
}

pub struct ConnectionBillingManager {
    sessions: RwLock<HashMap<String, ConnectionSession>>,
    config: ConnectionBillingConfig,
    clock: SharedClock,
}

impl ConnectionBillingManager {
    pub fn new(config: ConnectionBillingConfig, clock: SharedClock) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn start_session(&self, session_id: &str, api_key: &str, transport: &str) -> ConnectionSession {
        let now = self.clock.now_ms();
        let session = ConnectionSession {
            session_id: session_id.to_string(),
            api_key: api_key.to_string(),
            transport: transport.to_string(),
            started_at: now,
            ended_at: None,
            last_activity_at: now,
            intervals_billed: 0,
            credits_billed: 0,
            paused: false,
        };
        self.sessions
            .write()
            .insert(session_id.to_string(), session.clone());
        debug!(session = session_id, transport, "connection session started");
        session
    }

    /// Record activity on the session, resetting its idle clock.
    pub fn touch(&self, session_id: &str) {
        let now = self.clock.now_ms();
        if let Some(session) = self.sessions.write().get_mut(session_id) {
            session.last_activity_at = now;
        }
    }

    pub fn set_paused(&self, session_id: &str, paused: bool) -> bool {
        match self.sessions.write().get_mut(session_id) {
            Some(session) => {
                session.paused = paused;
                true
            }
            None => false,
        }
    }

    pub fn end_session(&self, session_id: &str) -> Option<ConnectionSession> {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id)?;
        if session.ended_at.is_none() {
            session.ended_at = Some(now);
        }
        Some(session.clone())
    }

    pub fn get_session(&self, session_id: &str) -> Option<ConnectionSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<ConnectionSession> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.ended_at.is_none())
            .cloned()
            .collect()
    }

    /// Bill one session. `check_credits` reports the credits available to
    /// the session's key; when it cannot cover the owed intervals the
    /// session is flagged for termination with no partial charge.
    ///
    /// The checks run in a fixed order: unknown session, unbilled
    /// transport, idle timeout, duration cap, pause/disable, grace period,
    /// interval arithmetic, credit check, charge.
    pub fn bill<F>(&self, session_id: &str, check_credits: Option<&F>) -> ConnectionBillResult
    where
        F: Fn(&str) -> u64,
    {
        let now = self.clock.now_ms();
        let mut sessions = self.sessions.write();

        let session = match sessions.get_mut(session_id) {
            Some(s) if s.ended_at.is_none() => s,
            _ => return ConnectionBillResult::noop(session_id, 0),
        };
        let duration_seconds = (now.saturating_sub(session.started_at)) / 1_000;

        if !self
            .config
            .billed_transports
            .iter()
            .any(|t| t == &session.transport)
        {
            return ConnectionBillResult::noop(session_id, duration_seconds);
        }

        if self.config.idle_timeout_seconds > 0 {
            let idle_seconds = (now.saturating_sub(session.last_activity_at)) / 1_000;
            if idle_seconds >= self.config.idle_timeout_seconds {
                session.ended_at = Some(now);
                info!(session = session_id, idle_seconds, "session idle timeout");
                return ConnectionBillResult::terminate(session_id, duration_seconds, TERMINATE_IDLE);
            }
        }

        if self.config.max_duration_seconds > 0 && duration_seconds >= self.config.max_duration_seconds
        {
            session.ended_at = Some(now);
            info!(session = session_id, duration_seconds, "session hit max duration");
            return ConnectionBillResult::terminate(
                session_id,
                duration_seconds,
                TERMINATE_MAX_DURATION,
            );
        }

        if session.paused || !self.config.enabled {
            return ConnectionBillResult::noop(session_id, duration_seconds);
        }

        if duration_seconds < self.config.grace_period_seconds {
            return ConnectionBillResult::noop(session_id, duration_seconds);
        }

        let expected_intervals = (duration_seconds - self.config.grace_period_seconds)
            / self.config.interval_seconds.max(1);
        let intervals_to_bill = expected_intervals.saturating_sub(session.intervals_billed);
        if intervals_to_bill == 0 {
            return ConnectionBillResult::noop(session_id, duration_seconds);
        }

        let credits_to_charge = intervals_to_bill * self.config.credits_per_interval;
        if let Some(check) = check_credits {
            let available = check(&session.api_key);
            if available < credits_to_charge {
                session.ended_at = Some(now);
                info!(
                    session = session_id,
                    available, credits_to_charge, "session out of credits"
                );
                return ConnectionBillResult::terminate(
                    session_id,
                    duration_seconds,
                    TERMINATE_INSUFFICIENT,
                );
            }
        }

        session.credits_billed += credits_to_charge;
        session.intervals_billed = expected_intervals;
        debug!(
            session = session_id,
            credits_to_charge, expected_intervals, "session billed"
        );
        ConnectionBillResult {
            session_id: session_id.to_string(),
            credits_charged: credits_to_charge,
            should_terminate: false,
            terminate_reason: None,
            duration_seconds,
        }
    }

    /// Bill every active session. Callers run this on a cadence close to
    /// `interval_seconds`.
    pub fn bill_all<F>(&self, check_credits: Option<&F>) -> Vec<ConnectionBillResult>
    where
        F: Fn(&str) -> u64,
    {
        let ids: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.ended_at.is_none())
            .map(|s| s.session_id.clone())
            .collect();
        ids.iter().map(|id| self.bill(id, check_credits)).collect()
    }

    /// Prospective cost of a connection held open for the given minutes.
    pub fn estimate_cost(&self, minutes: u64) -> u64 {
        let duration_seconds = minutes * 60;
        if duration_seconds < self.config.grace_period_seconds {
            return 0;
        }
        let intervals = (duration_seconds - self.config.grace_period_seconds)
            / self.config.interval_seconds.max(1);
        intervals * self.config.credits_per_interval
    }

    /// Drop ended sessions older than the given age.
    pub fn prune_ended(&self, older_than_ms: u64) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(older_than_ms);
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| match s.ended_at {
            Some(ended) => ended > cutoff,
            None => true,
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn manager(config: ConnectionBillingConfig) -> (ConnectionBillingManager, Arc<ManualClock>) {
        let clock = ManualClock::shared(0);
        (ConnectionBillingManager::new(config, clock.clone()), clock)
    }

    fn config() -> ConnectionBillingConfig {
        ConnectionBillingConfig {
            enabled: true,
            interval_seconds: 60,
            credits_per_interval: 2,
            grace_period_seconds: 60,
            idle_timeout_seconds: 600,
            max_duration_seconds: 0,
            billed_transports: vec!["sse".to_string()],
        }
    }

    fn plenty(_: &str) -> u64 {
        1_000_000
    }

    #[test]
    fn test_unknown_session_noop() {
        let (mgr, _) = manager(config());
        let bill = mgr.bill("nope", Some(&plenty));
        assert_eq!(bill.credits_charged, 0);
        assert!(!bill.should_terminate);
    }

    #[test]
    fn test_unbilled_transport_noop() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "stdio");
        clock.advance(10 * 60_000);
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 0);
        assert!(!bill.should_terminate);
    }

    #[test]
    fn test_grace_period_free() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        clock.advance(59_000);
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 0);
        assert_eq!(bill.duration_seconds, 59);
    }

    #[test]
    fn test_interval_billing_after_grace() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");

        // 60s grace + 2 complete 60s intervals.
        clock.advance(185_000);
        mgr.touch("s1");
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 4); // 2 intervals x 2 credits
        assert!(!bill.should_terminate);

        // Immediately re-billing charges nothing new.
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 0);

        // One more interval accrues.
        clock.advance(60_000);
        mgr.touch("s1");
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 2);

        let session = mgr.get_session("s1").unwrap();
        assert_eq!(session.intervals_billed, 3);
        assert_eq!(session.credits_billed, 6);
    }

    #[test]
    fn test_idle_timeout_terminates_without_charge() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        clock.advance(600_000);
        let bill = mgr.bill("s1", Some(&plenty));
        assert!(bill.should_terminate);
        assert_eq!(bill.terminate_reason.as_deref(), Some(TERMINATE_IDLE));
        assert_eq!(bill.credits_charged, 0);
        assert!(mgr.get_session("s1").unwrap().ended_at.is_some());
    }

    #[test]
    fn test_max_duration_terminates() {
        let mut cfg = config();
        cfg.max_duration_seconds = 120;
        cfg.idle_timeout_seconds = 0;
        let (mgr, clock) = manager(cfg);
        mgr.start_session("s1", "tg_k", "sse");
        clock.advance(120_000);
        let bill = mgr.bill("s1", Some(&plenty));
        assert!(bill.should_terminate);
        assert_eq!(bill.terminate_reason.as_deref(), Some(TERMINATE_MAX_DURATION));
    }

    #[test]
    fn test_paused_and_disabled_skip_charging() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        mgr.set_paused("s1", true);
        clock.advance(300_000);
        mgr.touch("s1");
        let bill = mgr.bill("s1", Some(&plenty));
        assert_eq!(bill.credits_charged, 0);
        assert!(!bill.should_terminate);

        let mut cfg = config();
        cfg.enabled = false;
        let (mgr, clock) = manager(cfg);
        mgr.start_session("s1", "tg_k", "sse");
        clock.advance(300_000);
        mgr.touch("s1");
        assert_eq!(mgr.bill("s1", Some(&plenty)).credits_charged, 0);
    }

    #[test]
    fn test_insufficient_credits_terminates_with_no_partial_charge() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        clock.advance(185_000); // owes 2 intervals = 4 credits
        mgr.touch("s1");
        let broke = |_: &str| 3u64;
        let bill = mgr.bill("s1", Some(&broke));
        assert!(bill.should_terminate);
        assert_eq!(bill.terminate_reason.as_deref(), Some(TERMINATE_INSUFFICIENT));
        assert_eq!(bill.credits_charged, 0);
        assert_eq!(mgr.get_session("s1").unwrap().credits_billed, 0);
    }

    #[test]
    fn test_bill_all_covers_active_sessions() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_a", "sse");
        mgr.start_session("s2", "tg_b", "sse");
        clock.advance(125_000);
        mgr.touch("s1");
        mgr.touch("s2");

        let bills = mgr.bill_all(Some(&plenty));
        assert_eq!(bills.len(), 2);
        assert!(bills.iter().all(|b| b.credits_charged == 2));
    }

    #[test]
    fn test_billing_monotone() {
        // intervals_billed and credits_billed never decrease.
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        let mut last_intervals = 0;
        let mut last_credits = 0;
        for _ in 0..10 {
            clock.advance(45_000);
            mgr.touch("s1");
            mgr.bill("s1", Some(&plenty));
            let s = mgr.get_session("s1").unwrap();
            assert!(s.intervals_billed >= last_intervals);
            assert!(s.credits_billed >= last_credits);
            last_intervals = s.intervals_billed;
            last_credits = s.credits_billed;
        }
    }

    #[test]
    fn test_estimate_cost() {
        let (mgr, _) = manager(config());
        assert_eq!(mgr.estimate_cost(0), 0);
        // 10 minutes: 600s - 60s grace = 540s -> 9 intervals x 2 credits.
        assert_eq!(mgr.estimate_cost(10), 18);
    }

    #[test]
    fn test_prune_ended() {
        let (mgr, clock) = manager(config());
        mgr.start_session("s1", "tg_k", "sse");
        mgr.end_session("s1");
        clock.advance(100_000);
        assert_eq!(mgr.prune_ended(50_000), 1);
        assert!(mgr.get_session("s1").is_none());
    }
}
