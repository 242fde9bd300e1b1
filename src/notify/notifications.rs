// Notification Dispatch
//
// Events flow through rules (filtered by event name) to named channels.
// Each (rule, channel, key) trio is throttled independently so one noisy
// key cannot silence alerts about another.

use crate::clock::SharedClock;
use crate::notify::template::WebhookTemplateEngine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    /// "webhook" | "log" | transport-specific kinds.
    pub kind: String,
    /// Webhook endpoint id for webhook channels.
    #[serde(default)]
    pub endpoint_id: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    /// Event name this rule listens for.
    pub event: String,
    pub channels: Vec<String>,
    pub enabled: bool,
    pub throttle_ms: u64,
    /// Optional template; payload fields are exposed as variables.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Throttled,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    pub rule_id: String,
    pub channel: String,
    pub event: String,
    pub status: NotificationStatus,
    pub rendered: Option<String>,
    pub payload: Value,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub max_history: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { max_history: 1_000 }
    }
}

pub struct NotificationManager {
    channels: RwLock<HashMap<String, NotificationChannel>>,
    rules: RwLock<Vec<NotificationRule>>,
    history: RwLock<VecDeque<NotificationRecord>>,
    /// (rule id, channel, key) -> last sent timestamp
    throttle: RwLock<HashMap<(String, String, String), u64>>,
    config: NotificationConfig,
    clock: SharedClock,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig, clock: SharedClock) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            throttle: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    pub fn add_channel(&self, name: &str, kind: &str, endpoint_id: Option<&str>) {
        self.channels.write().insert(
            name.to_string(),
            NotificationChannel {
                name: name.to_string(),
                kind: kind.to_string(),
                endpoint_id: endpoint_id.map(|e| e.to_string()),
                enabled: true,
            },
        );
    }

    pub fn set_channel_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.channels.write().get_mut(name) {
            Some(channel) => {
                channel.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn add_rule(
        &self,
        event: &str,
        channels: Vec<String>,
        throttle_ms: u64,
        template: Option<&str>,
    ) -> NotificationRule {
        let rule = NotificationRule {
            id: Uuid::new_v4().to_string(),
            event: event.to_string(),
            channels,
            enabled: true,
            throttle_ms,
            template: template.map(|t| t.to_string()),
        };
        self.rules.write().push(rule.clone());
        rule
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.id != rule_id);
        rules.len() != before
    }

    pub fn list_rules(&self) -> Vec<NotificationRule> {
        self.rules.read().clone()
    }

    pub fn list_channels(&self) -> Vec<NotificationChannel> {
        self.channels.read().values().cloned().collect()
    }

    /// Dispatch an event through every matching rule. Returns one record
    /// per (rule, channel) pairing; webhook egress is the caller's job,
    /// driven by the returned `sent` records.
    pub fn dispatch(&self, event: &str, payload: &Value) -> Vec<NotificationRecord> {
        let now = self.clock.now_ms();
        let key = payload
            .get("key")
            .and_then(|k| k.as_str())
            .unwrap_or("")
            .to_string();
        let vars = flatten_payload(payload);

        let rules: Vec<NotificationRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.enabled && r.event == event)
            .cloned()
            .collect();

        let mut records = Vec::new();
        for rule in rules {
            for channel_name in &rule.channels {
                let channel = self.channels.read().get(channel_name).cloned();
                let status = match channel {
                    Some(channel) if channel.enabled => {
                        let throttle_key =
                            (rule.id.clone(), channel_name.clone(), key.clone());
                        let mut throttle = self.throttle.write();
                        let last = throttle.get(&throttle_key).copied();
                        if last
                            .map(|t| now.saturating_sub(t) < rule.throttle_ms)
                            .unwrap_or(false)
                        {
                            NotificationStatus::Throttled
                        } else {
                            throttle.insert(throttle_key, now);
                            NotificationStatus::Sent
                        }
                    }
                    _ => NotificationStatus::Skipped,
                };

                let rendered = match (&rule.template, status) {
                    (Some(template), NotificationStatus::Sent) => {
                        Some(WebhookTemplateEngine::render(template, &vars))
                    }
                    _ => None,
                };

                debug!(event, channel = %channel_name, status = ?status, "notification");
                records.push(NotificationRecord {
                    id: Uuid::new_v4().to_string(),
                    rule_id: rule.id.clone(),
                    channel: channel_name.clone(),
                    event: event.to_string(),
                    status,
                    rendered,
                    payload: payload.clone(),
                    timestamp: now,
                });
            }
        }

        let mut history = self.history.write();
        for record in &records {
            history.push_back(record.clone());
        }
        while history.len() > self.config.max_history {
            history.pop_front();
        }
        records
    }

    pub fn history(&self, limit: usize) -> Vec<NotificationRecord> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }
}

// Top-level payload fields become template variables; nested values render
// as compact JSON.
fn flatten_payload(payload: &Value) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Some(map) = payload.as_object() {
        for (name, value) in map {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(name.clone(), rendered);
        }
    }
    vars
}
