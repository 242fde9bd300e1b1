// Metrics Aggregation
//
// Raw per-call records bounded by count and age, summarized on demand with
// sorted-array percentiles and a per-tool breakdown.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub method: String,
    pub tool: String,
    pub key: String,
    pub latency_ms: u64,
    pub status_code: u16,
    pub credits: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub max_records: usize,
    pub max_age_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_records: 100_000,
            max_age_ms: 86_400_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub tool: Option<String>,
    pub key: Option<String>,
    pub method: Option<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolMetrics {
    pub tool: String,
    pub call_count: u64,
    pub total_credits: u64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_calls: u64,
    pub total_credits: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p90_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub by_tool: Vec<ToolMetrics>,
}

pub struct ApiMetricsAggregator {
    records: RwLock<VecDeque<MetricRecord>>,
    config: MetricsConfig,
    clock: SharedClock,
}

impl ApiMetricsAggregator {
    pub fn new(config: MetricsConfig, clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            config,
            clock,
        }
    }

    pub fn record(
        &self,
        method: &str,
        tool: &str,
        key: &str,
        latency_ms: u64,
        status_code: u16,
        credits: u64,
    ) {
        let now = self.clock.now_ms();
        let mut records = self.records.write();
        records.push_back(MetricRecord {
            method: method.to_string(),
            tool: tool.to_string(),
            key: key.to_string(),
            latency_ms,
            status_code,
            credits,
            timestamp: now,
        });

        let cutoff = now.saturating_sub(self.config.max_age_ms);
        while let Some(front) = records.front() {
            if front.timestamp < cutoff || records.len() > self.config.max_records {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn records(&self, filter: &MetricsFilter) -> Vec<MetricRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| matches(r, filter))
            .cloned()
            .collect()
    }

    /// Summarize the records passing the filter.
    pub fn summary(&self, filter: &MetricsFilter) -> MetricsSummary {
        let filtered = self.records(filter);

        let total_calls = filtered.len() as u64;
        let total_credits = filtered.iter().map(|r| r.credits).sum();
        let error_count = filtered.iter().filter(|r| r.status_code >= 400).count() as u64;
        let avg_latency_ms = if filtered.is_empty() {
            0.0
        } else {
            filtered.iter().map(|r| r.latency_ms as f64).sum::<f64>() / filtered.len() as f64
        };

        let mut latencies: Vec<u64> = filtered.iter().map(|r| r.latency_ms).collect();
        latencies.sort_unstable();

        let mut by_tool: HashMap<String, ToolMetrics> = HashMap::new();
        for record in &filtered {
            let entry = by_tool
                .entry(record.tool.clone())
                .or_insert_with(|| ToolMetrics {
                    tool: record.tool.clone(),
                    call_count: 0,
                    total_credits: 0,
                    avg_latency_ms: 0.0,
                    error_count: 0,
                });
            let n = entry.call_count as f64;
            entry.avg_latency_ms = (entry.avg_latency_ms * n + record.latency_ms as f64) / (n + 1.0);
            entry.call_count += 1;
            entry.total_credits += record.credits;
            if record.status_code >= 400 {
                entry.error_count += 1;
            }
        }
        let mut by_tool: Vec<ToolMetrics> = by_tool.into_values().collect();
        by_tool.sort_by(|a, b| b.call_count.cmp(&a.call_count));

        MetricsSummary {
            total_calls,
            total_credits,
            error_count,
            avg_latency_ms,
            p50_latency_ms: percentile(&latencies, 50.0),
            p90_latency_ms: percentile(&latencies, 90.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            by_tool,
        }
    }
}

fn matches(record: &MetricRecord, filter: &MetricsFilter) -> bool {
    if let Some(tool) = &filter.tool {
        if &record.tool != tool {
            return false;
        }
    }
    if let Some(key) = &filter.key {
        if &record.key != key {
            return false;
        }
    }
    if let Some(method) = &filter.method {
        if &record.method != method {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if record.timestamp < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if record.timestamp > until {
            return false;
        }
    }
    true
}

// Sorted-array percentile: index ceil(p/100 x n) - 1, clamped at zero.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn aggregator(max_records: usize, max_age_ms: u64) -> (ApiMetricsAggregator, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000);
        let config = MetricsConfig {
            max_records,
            max_age_ms,
        };
        (ApiMetricsAggregator::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_percentile_index_formula() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), 50);
        assert_eq!(percentile(&sorted, 90.0), 90);
        assert_eq!(percentile(&sorted, 99.0), 99);
        assert_eq!(percentile(&sorted, 100.0), 100);
        assert_eq!(percentile(&[42], 50.0), 42);
        assert_eq!(percentile(&[], 50.0), 0);
        // Small arrays clamp to the first element.
        assert_eq!(percentile(&[10, 20], 1.0), 10);
    }

    #[test]
    fn test_summary_totals_and_errors() {
        let (agg, _) = aggregator(100, 60_000);
        agg.record("tools/call", "search", "tg_a", 100, 200, 5);
        agg.record("tools/call", "search", "tg_a", 200, 200, 5);
        agg.record("tools/call", "fetch", "tg_b", 300, 502, 0);

        let summary = agg.summary(&MetricsFilter::default());
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.total_credits, 10);
        assert_eq!(summary.error_count, 1);
        assert!((summary.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(summary.p50_latency_ms, 200);
        assert_eq!(summary.p99_latency_ms, 300);
    }

    #[test]
    fn test_per_tool_breakdown() {
        let (agg, _) = aggregator(100, 60_000);
        agg.record("tools/call", "search", "tg_a", 100, 200, 5);
        agg.record("tools/call", "search", "tg_a", 300, 200, 5);
        agg.record("tools/call", "fetch", "tg_a", 50, 200, 1);

        let summary = agg.summary(&MetricsFilter::default());
        assert_eq!(summary.by_tool.len(), 2);
        assert_eq!(summary.by_tool[0].tool, "search");
        assert_eq!(summary.by_tool[0].call_count, 2);
        assert!((summary.by_tool[0].avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_filters() {
        let (agg, clock) = aggregator(100, 600_000);
        agg.record("tools/call", "search", "tg_a", 100, 200, 5);
        clock.advance(1_000);
        agg.record("tools/call", "fetch", "tg_b", 100, 200, 5);

        let by_tool = agg.summary(&MetricsFilter {
            tool: Some("search".to_string()),
            ..Default::default()
        });
        assert_eq!(by_tool.total_calls, 1);

        let by_time = agg.summary(&MetricsFilter {
            since: Some(1_500),
            ..Default::default()
        });
        assert_eq!(by_time.total_calls, 1);

        let by_key = agg.records(&MetricsFilter {
            key: Some("tg_b".to_string()),
            ..Default::default()
        });
        assert_eq!(by_key.len(), 1);
        assert_eq!(by_key[0].tool, "fetch");
    }

    #[test]
    fn test_count_bound() {
        let (agg, _) = aggregator(3, 600_000);
        for i in 0..5 {
            agg.record("m", "t", "k", i, 200, 0);
        }
        assert_eq!(agg.len(), 3);
        let records = agg.records(&MetricsFilter::default());
        assert_eq!(records[0].latency_ms, 2); // oldest two dropped
    }

    #[test]
    fn test_age_bound() {
        let (agg, clock) = aggregator(100, 10_000);
        agg.record("m", "t", "k", 1, 200, 0);
        clock.advance(20_000);
        agg.record("m", "t", "k", 2, 200, 0);
        assert_eq!(agg.len(), 1);
    }
}
