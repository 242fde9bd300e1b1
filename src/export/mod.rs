// Usage Export
//
// Pulls filtered call records out of the metrics aggregator as JSON, JSON
// lines or CSV, with a row cap so an export cannot balloon a response.

use crate::error::Result;
use crate::monitoring::{ApiMetricsAggregator, MetricsFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    JsonLines,
    Csv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub max_rows: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { max_rows: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub format: ExportFormat,
    pub row_count: usize,
    pub truncated: bool,
    pub content: String,
}

pub struct UsageExportEngine {
    metrics: Arc<ApiMetricsAggregator>,
    config: ExportConfig,
}

impl UsageExportEngine {
    pub fn new(config: ExportConfig, metrics: Arc<ApiMetricsAggregator>) -> Self {
        Self { metrics, config }
    }

    pub fn export(&self, filter: &MetricsFilter, format: ExportFormat) -> Result<ExportResult> {
        let records = self.metrics.records(filter);
        let truncated = records.len() > self.config.max_rows;
        let rows = &records[..records.len().min(self.config.max_rows)];

        let content = match format {
            ExportFormat::Json => {
                let values: Vec<serde_json::Value> = rows.iter().map(row_json).collect();
                serde_json::to_string_pretty(&values)?
            }
            ExportFormat::JsonLines => {
                let mut out = String::new();
                for row in rows {
                    out.push_str(&serde_json::to_string(&row_json(row))?);
                    out.push('\n');
                }
                out
            }
            ExportFormat::Csv => {
                let mut out =
                    String::from("timestamp,method,tool,key,latency_ms,status_code,credits\n");
                for row in rows {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{}\n",
                        row.timestamp,
                        csv_escape(&row.method),
                        csv_escape(&row.tool),
                        csv_escape(&row.key),
                        row.latency_ms,
                        row.status_code,
                        row.credits
                    ));
                }
                out
            }
        };

        Ok(ExportResult {
            format,
            row_count: rows.len(),
            truncated,
            content,
        })
    }
}

fn row_json(record: &crate::monitoring::MetricRecord) -> serde_json::Value {
    json!({
        "timestamp": record.timestamp,
        "method": &record.method,
        "tool": &record.tool,
        "key": &record.key,
        "latency_ms": record.latency_ms,
        "status_code": record.status_code,
        "credits": record.credits,
    })
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::monitoring::MetricsConfig;

    fn engine(max_rows: usize) -> (UsageExportEngine, Arc<ApiMetricsAggregator>) {
        let clock = ManualClock::shared(1_000);
        let metrics = Arc::new(ApiMetricsAggregator::new(MetricsConfig::default(), clock));
        let engine = UsageExportEngine::new(ExportConfig { max_rows }, metrics.clone());
        (engine, metrics)
    }

    #[test]
    fn test_csv_export_with_header() {
        let (engine, metrics) = engine(100);
        metrics.record("tools/call", "search", "tg_a", 120, 200, 5);
        let result = engine
            .export(&MetricsFilter::default(), ExportFormat::Csv)
            .unwrap();
        let lines: Vec<&str> = result.content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("timestamp,"));
        assert!(lines[1].contains("search"));
        assert_eq!(result.row_count, 1);
        assert!(!result.truncated);
    }

    #[test]
    fn test_csv_escaping() {
        let (engine, metrics) = engine(100);
        metrics.record("m", "tool,with\"quote", "tg_a", 1, 200, 0);
        let result = engine
            .export(&MetricsFilter::default(), ExportFormat::Csv)
            .unwrap();
        assert!(result.content.contains("\"tool,with\"\"quote\""));
    }

    #[test]
    fn test_json_lines() {
        let (engine, metrics) = engine(100);
        metrics.record("m", "a", "k", 1, 200, 1);
        metrics.record("m", "b", "k", 2, 200, 2);
        let result = engine
            .export(&MetricsFilter::default(), ExportFormat::JsonLines)
            .unwrap();
        let lines: Vec<&str> = result.content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["tool"], "a");
    }

    #[test]
    fn test_json_array() {
        let (engine, metrics) = engine(100);
        metrics.record("m", "a", "k", 1, 200, 1);
        let result = engine
            .export(&MetricsFilter::default(), ExportFormat::Json)
            .unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_row_cap_truncates() {
        let (engine, metrics) = engine(2);
        for i in 0..5 {
            metrics.record("m", "t", "k", i, 200, 0);
        }
        let result = engine
            .export(&MetricsFilter::default(), ExportFormat::JsonLines)
            .unwrap();
        assert_eq!(result.row_count, 2);
        assert!(result.truncated);
    }

    #[test]
    fn test_filtered_export() {
        let (engine, metrics) = engine(100);
        metrics.record("m", "a", "tg_a", 1, 200, 1);
        metrics.record("m", "b", "tg_b", 2, 200, 2);
        let result = engine
            .export(
                &MetricsFilter {
                    key: Some("tg_b".to_string()),
                    ..Default::default()
                },
                ExportFormat::Csv,
            )
            .unwrap();
        assert_eq!(result.row_count, 1);
        assert!(result.content.contains("tg_b"));
    }
}
