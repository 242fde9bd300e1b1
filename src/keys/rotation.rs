// Key Rotation
//
// Policies define a rotation cadence and a grace period during which the
// previous key remains honored. The scheduler tracks per-key schedules and
// reports which keys are due; the actual key swap (minting the replacement,
// expiring the old record at grace end) is driven by the admin surface
// through the key store.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub id: String,
    pub interval_seconds: u64,
    pub grace_period_seconds: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub policy_id: String,
    /// The currently active key.
    pub key: String,
    pub next_rotation_at: u64,
    pub grace_active: bool,
    pub grace_previous_key: Option<String>,
    pub grace_expires_at: Option<u64>,
    pub rotations_completed: u64,
}

pub struct KeyRotationScheduler {
    policies: RwLock<HashMap<String, RotationPolicy>>,
    /// current key -> schedule
    schedules: RwLock<HashMap<String, RotationSchedule>>,
    clock: SharedClock,
}

impl KeyRotationScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn create_policy(&self, interval_seconds: u64, grace_period_seconds: u64) -> Result<RotationPolicy> {
        if interval_seconds == 0 {
            return Err(GateError::Validation(
                "rotation interval must be positive".to_string(),
            ));
        }
        let policy = RotationPolicy {
            id: Uuid::new_v4().to_string(),
            interval_seconds,
            grace_period_seconds,
            created_at: self.clock.now_ms(),
        };
        self.policies.write().insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    pub fn get_policy(&self, policy_id: &str) -> Option<RotationPolicy> {
        self.policies.read().get(policy_id).cloned()
    }

    /// Put a key on a rotation schedule.
    pub fn attach(&self, key: &str, policy_id: &str) -> Result<RotationSchedule> {
        let policy = self
            .get_policy(policy_id)
            .ok_or_else(|| GateError::NotFound(format!("policy {}", policy_id)))?;
        let mut schedules = self.schedules.write();
        if schedules.contains_key(key) {
            return Err(GateError::AlreadyExists("key already scheduled".to_string()));
        }
        let schedule = RotationSchedule {
            policy_id: policy.id.clone(),
            key: key.to_string(),
            next_rotation_at: self.clock.now_ms() + policy.interval_seconds * 1_000,
            grace_active: false,
            grace_previous_key: None,
            grace_expires_at: None,
            rotations_completed: 0,
        };
        schedules.insert(key.to_string(), schedule.clone());
        Ok(schedule)
    }

    pub fn detach(&self, key: &str) -> bool {
        self.schedules.write().remove(key).is_some()
    }

    /// Keys whose rotation is due.
    pub fn due(&self) -> Vec<RotationSchedule> {
        let now = self.clock.now_ms();
        self.schedules
            .read()
            .values()
            .filter(|s| s.next_rotation_at <= now)
            .cloned()
            .collect()
    }

    /// Record a completed rotation: the schedule moves to the replacement
    /// key and the old key enters its grace window.
    pub fn record_rotation(&self, old_key: &str, new_key: &str) -> Result<RotationSchedule> {
        let now = self.clock.now_ms();
        let mut schedules = self.schedules.write();
        let mut schedule = schedules
            .remove(old_key)
            .ok_or_else(|| GateError::NotFound("schedule for rotated key".to_string()))?;
        let policy = self
            .policies
            .read()
            .get(&schedule.policy_id)
            .cloned()
            .ok_or_else(|| GateError::NotFound(format!("policy {}", schedule.policy_id)))?;

        schedule.key = new_key.to_string();
        schedule.next_rotation_at = now + policy.interval_seconds * 1_000;
        schedule.rotations_completed += 1;
        if policy.grace_period_seconds > 0 {
            schedule.grace_active = true;
            schedule.grace_previous_key = Some(old_key.to_string());
            schedule.grace_expires_at = Some(now + policy.grace_period_seconds * 1_000);
        } else {
            schedule.grace_active = false;
            schedule.grace_previous_key = None;
            schedule.grace_expires_at = None;
        }
        schedules.insert(new_key.to_string(), schedule.clone());
        info!(rotations = schedule.rotations_completed, "rotated key");
        Ok(schedule)
    }

    /// Schedule for a key, with the grace flag lazily cleared once the
    /// grace window has passed.
    pub fn get_schedule(&self, key: &str) -> Option<RotationSchedule> {
        let now = self.clock.now_ms();
        let mut schedules = self.schedules.write();
        let schedule = schedules.get_mut(key)?;
        if schedule.grace_active {
            if let Some(expires) = schedule.grace_expires_at {
                if now >= expires {
                    schedule.grace_active = false;
                    schedule.grace_previous_key = None;
                    schedule.grace_expires_at = None;
                }
            }
        }
        Some(schedule.clone())
    }

    /// Whether the given (previous) key is still honored under grace.
    pub fn in_grace(&self, previous_key: &str) -> bool {
        let now = self.clock.now_ms();
        self.schedules.read().values().any(|s| {
            s.grace_active
                && s.grace_previous_key.as_deref() == Some(previous_key)
                && s.grace_expires_at.map(|t| now < t).unwrap_or(false)
        })
    }

    pub fn list_schedules(&self) -> Vec<RotationSchedule> {
        self.schedules.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn scheduler() -> (KeyRotationScheduler, Arc<ManualClock>) {
        let clock = ManualClock::shared(0);
        (KeyRotationScheduler::new(clock.clone()), clock)
    }

    #[test]
    fn test_attach_and_due() {
        let (sched, clock) = scheduler();
        let policy = sched.create_policy(3_600, 300).unwrap();
        sched.attach("tg_a", &policy.id).unwrap();

        assert!(sched.due().is_empty());
        clock.advance(3_600_000);
        let due = sched.due();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, "tg_a");
    }

    #[test]
    fn test_rotation_enters_grace() {
        let (sched, clock) = scheduler();
        let policy = sched.create_policy(3_600, 300).unwrap();
        sched.attach("tg_a", &policy.id).unwrap();
        clock.advance(3_600_000);

        let schedule = sched.record_rotation("tg_a", "tg_b").unwrap();
        assert!(schedule.grace_active);
        assert_eq!(schedule.grace_previous_key.as_deref(), Some("tg_a"));
        assert!(sched.in_grace("tg_a"));
        assert!(sched.get_schedule("tg_a").is_none());

        // Grace ends at a fixed time.
        clock.advance(300_000);
        assert!(!sched.in_grace("tg_a"));
        let schedule = sched.get_schedule("tg_b").unwrap();
        assert!(!schedule.grace_active);
        assert!(schedule.grace_previous_key.is_none());
    }

    #[test]
    fn test_zero_grace_skips_grace() {
        let (sched, clock) = scheduler();
        let policy = sched.create_policy(60, 0).unwrap();
        sched.attach("tg_a", &policy.id).unwrap();
        clock.advance(60_000);
        let schedule = sched.record_rotation("tg_a", "tg_b").unwrap();
        assert!(!schedule.grace_active);
        assert!(!sched.in_grace("tg_a"));
    }

    #[test]
    fn test_double_attach_rejected() {
        let (sched, _) = scheduler();
        let policy = sched.create_policy(60, 0).unwrap();
        sched.attach("tg_a", &policy.id).unwrap();
        assert!(sched.attach("tg_a", &policy.id).is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (sched, _) = scheduler();
        assert!(sched.create_policy(0, 0).is_err());
    }
}
