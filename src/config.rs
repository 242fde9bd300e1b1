// Proxy Configuration
//
// One aggregate of every subsystem's tunables plus the server-level
// settings. Defaults are serviceable for local use; the admin surface can
// report the effective configuration since everything here serializes.

use crate::billing::{BatchConfig, BillingCycleConfig, ConnectionBillingConfig, TransferConfig};
use crate::export::ExportConfig;
use crate::gate::{DedupConfig, RateLimitConfig, ValidatorConfig};
use crate::keys::{HierarchyConfig, KeyStoreConfig, ScopeConfig};
use crate::ledger::EventLedgerConfig;
use crate::monitoring::{ForecastConfig, MetricsConfig, QuotaAlertConfig, SloConfig};
use crate::notify::notifications::NotificationConfig;
use crate::notify::webhook_log::WebhookLogConfig;
use crate::pipeline::PipelineConfig;
use crate::routing::{BalancerConfig, BufferConfig};
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HTTP listen port for the metered and admin surfaces.
    pub port: u16,
    /// Directory for persisted state; in-memory only when unset.
    pub state_path: Option<String>,
    /// Downstream tool server command and arguments.
    pub backend_cmd: Option<String>,
    pub backend_args: Vec<String>,
    /// Per-request forward timeout.
    pub backend_timeout_ms: u64,
    /// Cadence of the connection-billing tick.
    pub billing_tick_seconds: u64,
    /// Credits per tool call when the tool has no explicit cost.
    pub default_tool_cost: u64,
    pub tool_costs: HashMap<String, u64>,
    /// A `credits.low` notification fires when a balance drops below this.
    pub low_balance_threshold: u64,

    pub ledger: EventLedgerConfig,
    pub keystore: KeyStoreConfig,
    pub rate_limit: RateLimitConfig,
    pub dedup: DedupConfig,
    pub validator: ValidatorConfig,
    pub pipeline: PipelineConfig,
    pub scopes: ScopeConfig,
    pub hierarchy: HierarchyConfig,
    pub connection_billing: ConnectionBillingConfig,
    pub sessions: SessionConfig,
    pub cycles: BillingCycleConfig,
    pub transfers: TransferConfig,
    pub batches: BatchConfig,
    pub balancer: BalancerConfig,
    pub buffer: BufferConfig,
    pub metrics: MetricsConfig,
    pub slo: SloConfig,
    pub forecast: ForecastConfig,
    pub quota_alerts: QuotaAlertConfig,
    pub notifications: NotificationConfig,
    pub webhooks: WebhookLogConfig,
    pub export: ExportConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8788,
            state_path: None,
            backend_cmd: None,
            backend_args: Vec::new(),
            backend_timeout_ms: 30_000,
            billing_tick_seconds: 60,
            default_tool_cost: 1,
            tool_costs: HashMap::new(),
            low_balance_threshold: 10,
            ledger: EventLedgerConfig::default(),
            keystore: KeyStoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dedup: DedupConfig::default(),
            validator: ValidatorConfig::default(),
            pipeline: PipelineConfig::default(),
            scopes: ScopeConfig::default(),
            hierarchy: HierarchyConfig::default(),
            connection_billing: ConnectionBillingConfig::default(),
            sessions: SessionConfig::default(),
            cycles: BillingCycleConfig::default(),
            transfers: TransferConfig::default(),
            batches: BatchConfig::default(),
            balancer: BalancerConfig::default(),
            buffer: BufferConfig::default(),
            metrics: MetricsConfig::default(),
            slo: SloConfig::default(),
            forecast: ForecastConfig::default(),
            quota_alerts: QuotaAlertConfig::default(),
            notifications: NotificationConfig::default(),
            webhooks: WebhookLogConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Cost in credits of one call to the given tool.
    pub fn tool_cost(&self, tool: &str) -> u64 {
        self.tool_costs
            .get(tool)
            .copied()
            .unwrap_or(self.default_tool_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = ProxyConfig::default();
        assert!(config.port > 0);
        assert!(config.backend_timeout_ms > 0);
        assert_eq!(config.tool_cost("anything"), 1);
    }

    #[test]
    fn test_tool_cost_override() {
        let mut config = ProxyConfig::default();
        config.tool_costs.insert("expensive".to_string(), 25);
        assert_eq!(config.tool_cost("expensive"), 25);
        assert_eq!(config.tool_cost("cheap"), 1);
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = ProxyConfig::default();
        let raw = serde_json::to_string(&config).unwrap();
        let parsed: ProxyConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.port, config.port);
        assert_eq!(parsed.rate_limit.limit, config.rate_limit.limit);
    }

    #[test]
    fn test_partial_config_backfills() {
        let parsed: ProxyConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.default_tool_cost, 1);
    }
}
