// Monitoring
//
// Observability over the metered surface: raw call metrics with percentile
// summaries, rolling-window SLOs with error budgets, usage forecasting with
// anomaly detection, and percent-threshold quota alerts.

pub mod forecast;
pub mod metrics_aggregator;
pub mod quota_alerts;
pub mod slo;

pub use forecast::{Anomaly, AnomalyKind, Forecast, ForecastConfig, Trend, UsageForecastEngine};
pub use metrics_aggregator::{
    ApiMetricsAggregator, MetricRecord, MetricsConfig, MetricsFilter, MetricsSummary, ToolMetrics,
};
pub use quota_alerts::{QuotaAlert, QuotaAlertConfig, UsageQuotaAlert};
pub use slo::{
    SloAlert, SloAlertKind, SloConfig, SloDefinition, SloEvent, SloMonitor, SloStatus, SloType,
};
