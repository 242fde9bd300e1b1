// Quota Alerts
//
// Percent-threshold alerts on per-key quotas. Each key tracks the set of
// thresholds already crossed; recording usage raises one alert per newly
// crossed threshold, and changing a quota resets and re-evaluates.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAlertConfig {
    /// Ascending percentages, e.g. [50, 80, 95, 100].
    pub thresholds: Vec<u32>,
    pub max_alerts: usize,
}

impl Default for QuotaAlertConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![50, 80, 95, 100],
            max_alerts: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaAlert {
    pub key: String,
    pub threshold_pct: u32,
    pub used: u64,
    pub quota: u64,
    pub usage_pct: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
struct KeyQuotaState {
    quota: u64,
    used: u64,
    crossed: HashSet<u32>,
}

pub struct UsageQuotaAlert {
    keys: RwLock<HashMap<String, KeyQuotaState>>,
    alerts: RwLock<VecDeque<QuotaAlert>>,
    thresholds: Vec<u32>,
    max_alerts: usize,
    clock: SharedClock,
}

impl UsageQuotaAlert {
    pub fn new(config: QuotaAlertConfig, clock: SharedClock) -> Self {
        let mut thresholds = config.thresholds;
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            keys: RwLock::new(HashMap::new()),
            alerts: RwLock::new(VecDeque::new()),
            thresholds,
            max_alerts: config.max_alerts,
            clock,
        }
    }

    /// Set or replace a key's quota. The crossed set resets and current
    /// usage is re-evaluated against the new quota.
    pub fn set_quota(&self, key: &str, quota: u64) -> Vec<QuotaAlert> {
        let mut keys = self.keys.write();
        let state = keys.entry(key.to_string()).or_default();
        state.quota = quota;
        state.crossed.clear();
        let raised = self.newly_crossed(key, state);
        drop(keys);
        self.push_alerts(&raised);
        raised
    }

    /// Record additional usage; returns alerts for thresholds crossed by
    /// this update.
    pub fn record_usage(&self, key: &str, amount: u64) -> Vec<QuotaAlert> {
        let mut keys = self.keys.write();
        let state = match keys.get_mut(key) {
            Some(state) if state.quota > 0 => state,
            _ => return Vec::new(),
        };
        state.used += amount;
        let raised = self.newly_crossed(key, state);
        drop(keys);
        self.push_alerts(&raised);
        raised
    }

    /// Reset a key's usage counter (e.g. on quota-period rollover).
    pub fn reset_usage(&self, key: &str) {
        let mut keys = self.keys.write();
        if let Some(state) = keys.get_mut(key) {
            state.used = 0;
            state.crossed.clear();
        }
    }

    pub fn usage_pct(&self, key: &str) -> Option<f64> {
        let keys = self.keys.read();
        let state = keys.get(key)?;
        if state.quota == 0 {
            return None;
        }
        Some(state.used as f64 / state.quota as f64 * 100.0)
    }

    pub fn alerts(&self, limit: usize) -> Vec<QuotaAlert> {
        self.alerts.read().iter().rev().take(limit).cloned().collect()
    }

    fn newly_crossed(&self, key: &str, state: &mut KeyQuotaState) -> Vec<QuotaAlert> {
        if state.quota == 0 {
            return Vec::new();
        }
        let pct = state.used as f64 / state.quota as f64 * 100.0;
        let now = self.clock.now_ms();
        let mut raised = Vec::new();
        for &threshold in &self.thresholds {
            if pct >= threshold as f64 && !state.crossed.contains(&threshold) {
                state.crossed.insert(threshold);
                raised.push(QuotaAlert {
                    key: key.to_string(),
                    threshold_pct: threshold,
                    used: state.used,
                    quota: state.quota,
                    usage_pct: pct,
                    timestamp: now,
                });
            }
        }
        raised
    }

    fn push_alerts(&self, raised: &[QuotaAlert]) {
        if raised.is_empty() {
            return;
        }
        for alert in raised {
            info!(
                key = %alert.key,
                threshold = alert.threshold_pct,
                pct = alert.usage_pct,
                "quota threshold crossed"
            );
        }
        let mut alerts = self.alerts.write();
        for alert in raised {
            alerts.push_back(alert.clone());
        }
        while alerts.len() > self.max_alerts {
            alerts.pop_front();
        }
    }
}
