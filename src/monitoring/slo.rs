// SLO Monitoring
//
// Rolling-window service level objectives over the metered surface.
// Latency SLOs count events under a threshold as good; availability and
// error-rate SLOs count successes. Status reads derive the error budget
// and its burn rate; alerts fire on budget exhaustion, budget warnings
// and fast burn, deduplicated per (slo, kind) inside a 60s window.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::warn;
use uuid::Uuid;

const ALERT_DEDUP_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloType {
    Latency,
    Availability,
    ErrorRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloDefinition {
    pub id: String,
    pub name: String,
    pub slo_type: SloType,
    /// Target good-event ratio in (0, 1].
    pub target: f64,
    /// Latency SLOs only.
    pub threshold_ms: Option<u64>,
    pub window_seconds: u64,
    /// Empty means all tools.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Empty means all keys.
    #[serde(default)]
    pub keys: Vec<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloEvent {
    pub tool: String,
    pub key: Option<String>,
    pub latency_ms: u64,
    pub success: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloStatus {
    pub slo_id: String,
    pub compliant: bool,
    pub current: f64,
    pub target: f64,
    pub total_events: u64,
    pub good_events: u64,
    pub budget_total: f64,
    pub budget_consumed: f64,
    pub budget_remaining: f64,
    pub burn_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SloAlertKind {
    BudgetExhausted,
    BudgetWarning,
    BurnRateHigh,
}

#[derive(Debug, Clone, Serialize)]
pub struct SloAlert {
    pub slo_id: String,
    pub kind: SloAlertKind,
    pub message: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// budget_warning fires when remaining < this fraction of the budget.
    pub warning_threshold: f64,
    /// burn_rate_high fires when the burn rate exceeds this multiple.
    pub burn_rate_alert_multiplier: f64,
    pub max_events: usize,
    pub max_alerts: usize,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.2,
            burn_rate_alert_multiplier: 2.0,
            max_events: 100_000,
            max_alerts: 1_000,
        }
    }
}

pub struct SloMonitor {
    definitions: RwLock<HashMap<String, SloDefinition>>,
    events: RwLock<VecDeque<SloEvent>>,
    alerts: RwLock<VecDeque<SloAlert>>,
    last_alert: RwLock<HashMap<(String, SloAlertKind), u64>>,
    config: SloConfig,
    clock: SharedClock,
}

impl SloMonitor {
    pub fn new(config: SloConfig, clock: SharedClock) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            events: RwLock::new(VecDeque::new()),
            alerts: RwLock::new(VecDeque::new()),
            last_alert: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn define_slo(
        &self,
        name: &str,
        slo_type: SloType,
        target: f64,
        threshold_ms: Option<u64>,
        window_seconds: u64,
        tools: Vec<String>,
        keys: Vec<String>,
    ) -> Result<SloDefinition> {
        if !(target > 0.0 && target <= 1.0) {
            return Err(GateError::Validation(
                "target must be in (0, 1]".to_string(),
            ));
        }
        if slo_type == SloType::Latency && threshold_ms.is_none() {
            return Err(GateError::Validation(
                "latency SLOs require threshold_ms".to_string(),
            ));
        }
        if window_seconds == 0 {
            return Err(GateError::Validation(
                "window must be positive".to_string(),
            ));
        }
        let slo = SloDefinition {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            slo_type,
            target,
            threshold_ms,
            window_seconds,
            tools,
            keys,
            created_at: self.clock.now_ms(),
        };
        self.definitions.write().insert(slo.id.clone(), slo.clone());
        Ok(slo)
    }

    pub fn remove_slo(&self, slo_id: &str) -> bool {
        self.definitions.write().remove(slo_id).is_some()
    }

    pub fn list_slos(&self) -> Vec<SloDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    /// Record one observed call and evaluate every matching SLO for alerts.
    pub fn record_event(&self, tool: &str, key: Option<&str>, latency_ms: u64, success: bool) {
        let now = self.clock.now_ms();
        {
            let mut events = self.events.write();
            events.push_back(SloEvent {
                tool: tool.to_string(),
                key: key.map(|k| k.to_string()),
                latency_ms,
                success,
                timestamp: now,
            });
            while events.len() > self.config.max_events {
                events.pop_front();
            }
        }

        let definitions: Vec<SloDefinition> =
            self.definitions.read().values().cloned().collect();
        for slo in definitions {
            if let Some(status) = self.compute_status(&slo.id) {
                self.evaluate_alerts(&slo, &status, now);
            }
        }
    }

    /// Current status of one SLO over its rolling window.
    pub fn compute_status(&self, slo_id: &str) -> Option<SloStatus> {
        let now = self.clock.now_ms();
        let slo = self.definitions.read().get(slo_id).cloned()?;
        let window_ms = slo.window_seconds * 1_000;
        let window_start = now.saturating_sub(window_ms);

        let events = self.events.read();
        let mut total = 0u64;
        let mut good = 0u64;
        for event in events.iter() {
            if event.timestamp < window_start {
                continue;
            }
            if !slo.tools.is_empty() && !slo.tools.iter().any(|t| t == &event.tool) {
                continue;
            }
            if !slo.keys.is_empty() {
                match &event.key {
                    Some(key) if slo.keys.iter().any(|k| k == key) => {}
                    _ => continue,
                }
            }
            total += 1;
            let is_good = match slo.slo_type {
                SloType::Latency => event.latency_ms <= slo.threshold_ms.unwrap_or(u64::MAX),
                SloType::Availability | SloType::ErrorRate => event.success,
            };
            if is_good {
                good += 1;
            }
        }

        let current = if total == 0 { 1.0 } else { good as f64 / total as f64 };
        let budget_total = 1.0 - slo.target;
        let budget_consumed = if total == 0 {
            0.0
        } else {
            (total - good) as f64 / total as f64
        };
        let budget_remaining = (budget_total - budget_consumed).max(0.0);

        // Elapsed fraction of the window since the SLO was defined, capped
        // at a full window.
        let elapsed = now.saturating_sub(slo.created_at).min(window_ms);
        let elapsed_fraction = if window_ms == 0 {
            1.0
        } else {
            (elapsed as f64 / window_ms as f64).max(f64::MIN_POSITIVE)
        };
        let burn_rate = if budget_total <= 0.0 {
            if budget_consumed > 0.0 {
                f64::INFINITY
            } else {
                0.0
            }
        } else {
            budget_consumed / (budget_total * elapsed_fraction)
        };

        Some(SloStatus {
            slo_id: slo.id.clone(),
            compliant: current >= slo.target,
            current,
            target: slo.target,
            total_events: total,
            good_events: good,
            budget_total,
            budget_consumed,
            budget_remaining,
            burn_rate,
        })
    }

    pub fn alerts(&self, limit: usize) -> Vec<SloAlert> {
        self.alerts.read().iter().rev().take(limit).cloned().collect()
    }

    fn evaluate_alerts(&self, slo: &SloDefinition, status: &SloStatus, now: u64) {
        if status.total_events == 0 {
            return;
        }
        if status.budget_remaining <= 0.0 && status.budget_consumed > 0.0 {
            self.raise(
                slo,
                SloAlertKind::BudgetExhausted,
                format!("error budget exhausted ({:.4} consumed)", status.budget_consumed),
                now,
            );
        } else if status.budget_remaining < self.config.warning_threshold * status.budget_total {
            self.raise(
                slo,
                SloAlertKind::BudgetWarning,
                format!("error budget low ({:.4} remaining)", status.budget_remaining),
                now,
            );
        }
        if status.burn_rate > self.config.burn_rate_alert_multiplier {
            self.raise(
                slo,
                SloAlertKind::BurnRateHigh,
                format!("burn rate {:.2}x", status.burn_rate),
                now,
            );
        }
    }

    fn raise(&self, slo: &SloDefinition, kind: SloAlertKind, message: String, now: u64) {
        {
            let mut last = self.last_alert.write();
            let dedup_key = (slo.id.clone(), kind);
            if let Some(previous) = last.get(&dedup_key) {
                if now.saturating_sub(*previous) < ALERT_DEDUP_MS {
                    return;
                }
            }
            last.insert(dedup_key, now);
        }
        warn!(slo = %slo.name, kind = ?kind, %message, "SLO alert");
        let mut alerts = self.alerts.write();
        alerts.push_back(SloAlert {
            slo_id: slo.id.clone(),
            kind,
            message,
            timestamp: now,
        });
        while alerts.len() > self.config.max_alerts {
            alerts.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn monitor() -> (SloMonitor, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000_000);
        (SloMonitor::new(SloConfig::default(), clock.clone()), clock)
    }

    #[test]
    fn test_definition_validation() {
        let (mon, _) = monitor();
        assert!(mon
            .define_slo("bad", SloType::Availability, 0.0, None, 60, vec![], vec![])
            .is_err());
        assert!(mon
            .define_slo("bad", SloType::Latency, 0.99, None, 60, vec![], vec![])
            .is_err());
        assert!(mon
            .define_slo("ok", SloType::Latency, 0.99, Some(500), 60, vec![], vec![])
            .is_ok());
    }

    #[test]
    fn test_latency_slo_status() {
        let (mon, _) = monitor();
        let slo = mon
            .define_slo("p99", SloType::Latency, 0.75, Some(100), 60, vec![], vec![])
            .unwrap();

        for latency in [50, 80, 120, 90] {
            mon.record_event("search", Some("tg_a"), latency, true);
        }
        let status = mon.compute_status(&slo.id).unwrap();
        assert_eq!(status.total_events, 4);
        assert_eq!(status.good_events, 3);
        assert!(status.compliant);
        assert!((status.current - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_compliant() {
        let (mon, _) = monitor();
        let slo = mon
            .define_slo("avail", SloType::Availability, 0.999, None, 60, vec![], vec![])
            .unwrap();
        let status = mon.compute_status(&slo.id).unwrap();
        assert!(status.compliant);
        assert_eq!(status.current, 1.0);
        assert_eq!(status.burn_rate, 0.0);
    }

    #[test]
    fn test_window_excludes_old_events() {
        let (mon, clock) = monitor();
        let slo = mon
            .define_slo("avail", SloType::Availability, 0.5, None, 10, vec![], vec![])
            .unwrap();
        mon.record_event("t", None, 1, false);
        clock.advance(11_000);
        mon.record_event("t", None, 1, true);
        let status = mon.compute_status(&slo.id).unwrap();
        assert_eq!(status.total_events, 1);
        assert_eq!(status.good_events, 1);
    }

    #[test]
    fn test_tool_and_key_filters() {
        let (mon, _) = monitor();
        let slo = mon
            .define_slo(
                "scoped",
                SloType::Availability,
                0.5,
                None,
                60,
                vec!["search".to_string()],
                vec!["tg_a".to_string()],
            )
            .unwrap();
        mon.record_event("search", Some("tg_a"), 1, true);
        mon.record_event("search", Some("tg_b"), 1, false);
        mon.record_event("fetch", Some("tg_a"), 1, false);
        mon.record_event("search", None, 1, false);

        let status = mon.compute_status(&slo.id).unwrap();
        assert_eq!(status.total_events, 1);
        assert!(status.compliant);
    }

    #[test]
    fn test_budget_math() {
        let (mon, _) = monitor();
        let slo = mon
            .define_slo("err", SloType::ErrorRate, 0.9, None, 60, vec![], vec![])
            .unwrap();
        for i in 0..10 {
            mon.record_event("t", None, 1, i != 0); // 1 failure in 10
        }
        let status = mon.compute_status(&slo.id).unwrap();
        assert!((status.budget_total - 0.1).abs() < 1e-9);
        assert!((status.budget_consumed - 0.1).abs() < 1e-9);
        assert!(status.budget_remaining.abs() < 1e-9);
        // current == target still counts as compliant.
        assert!(status.compliant);
    }

    #[test]
    fn test_budget_exhausted_alert_and_dedup() {
        let (mon, clock) = monitor();
        mon.define_slo("avail", SloType::Availability, 0.9, None, 3_600, vec![], vec![])
            .unwrap();
        for _ in 0..5 {
            mon.record_event("t", None, 1, false);
        }
        let alerts = mon.alerts(100);
        let exhausted: Vec<&SloAlert> = alerts
            .iter()
            .filter(|a| a.kind == SloAlertKind::BudgetExhausted)
            .collect();
        // Five failing events inside the dedup window raise one alert.
        assert_eq!(exhausted.len(), 1);

        // Past the dedup window the alert can fire again.
        clock.advance(61_000);
        mon.record_event("t", None, 1, false);
        let alerts = mon.alerts(100);
        let exhausted = alerts
            .iter()
            .filter(|a| a.kind == SloAlertKind::BudgetExhausted)
            .count();
        assert_eq!(exhausted, 2);
    }

    #[test]
    fn test_burn_rate_alert() {
        let (mon, clock) = monitor();
        mon.define_slo("avail", SloType::Availability, 0.5, None, 3_600, vec![], vec![])
            .unwrap();
        // Early in the window, concentrated failures burn far faster than
        // the budget allows.
        clock.advance(60_000);
        mon.record_event("t", None, 1, false);
        mon.record_event("t", None, 1, true);
        let alerts = mon.alerts(100);
        assert!(alerts.iter().any(|a| a.kind == SloAlertKind::BurnRateHigh));
    }
}
