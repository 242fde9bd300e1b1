// Usage Forecasting
//
// Credits consumed per key are aggregated into fixed time buckets. The
// forecast projects daily spend from the last seven days (bucket average
// plus a linear regression for the trend), and an exponential moving
// average feeds spike/drop anomaly detection.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const SEVEN_DAYS_S: u64 = 7 * 86_400;
const ANOMALY_MIN_POINTS: u64 = 10;
const ANOMALY_STDDEV_BUCKETS: usize = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub bucket_seconds: u64,
    pub ema_alpha: f64,
    /// Deviations at or above this many standard deviations are anomalous.
    pub anomaly_threshold: f64,
    pub max_buckets_per_key: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 3_600,
            ema_alpha: 0.3,
            anomaly_threshold: 3.0,
            max_buckets_per_key: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Forecast {
    pub key: String,
    pub daily_projection: f64,
    pub trend: Trend,
    pub slope: f64,
    pub r_squared: f64,
    pub days_until_exhaustion: Option<u64>,
    pub ema: f64,
    pub buckets_analyzed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Spike,
    Drop,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub key: String,
    pub kind: AnomalyKind,
    pub deviation: f64,
    pub recent_credits: f64,
    pub ema: f64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
struct KeyUsage {
    /// bucket start (seconds) -> credits in that bucket
    buckets: BTreeMap<u64, u64>,
    ema: f64,
    data_points: u64,
}

pub struct UsageForecastEngine {
    usage: RwLock<HashMap<String, KeyUsage>>,
    config: ForecastConfig,
    clock: SharedClock,
}

impl UsageForecastEngine {
    pub fn new(config: ForecastConfig, clock: SharedClock) -> Self {
        Self {
            usage: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Record credits consumed now. Same-bucket records aggregate; the EMA
    /// updates on every record.
    pub fn record(&self, key: &str, credits: u64) {
        let now_s = self.clock.now_ms() / 1_000;
        let bucket = now_s / self.config.bucket_seconds * self.config.bucket_seconds;

        let mut usage = self.usage.write();
        let entry = usage.entry(key.to_string()).or_default();
        *entry.buckets.entry(bucket).or_insert(0) += credits;
        entry.data_points += 1;
        entry.ema = if entry.data_points == 1 {
            credits as f64
        } else {
            self.config.ema_alpha * credits as f64 + (1.0 - self.config.ema_alpha) * entry.ema
        };

        while entry.buckets.len() > self.config.max_buckets_per_key {
            let oldest = *entry.buckets.keys().next().expect("non-empty");
            entry.buckets.remove(&oldest);
        }
    }

    /// Project usage from the last seven days of buckets.
    pub fn forecast(&self, key: &str, balance: Option<u64>) -> Option<Forecast> {
        let now_s = self.clock.now_ms() / 1_000;
        let usage = self.usage.read();
        let entry = usage.get(key)?;

        let window_start = now_s.saturating_sub(SEVEN_DAYS_S);
        let recent: Vec<(u64, u64)> = entry
            .buckets
            .range(window_start..)
            .map(|(start, credits)| (*start, *credits))
            .collect();
        if recent.is_empty() {
            return None;
        }

        let buckets_per_day = (86_400 / self.config.bucket_seconds.max(1)) as f64;
        let total: u64 = recent.iter().map(|(_, c)| c).sum();
        let avg_per_bucket = total as f64 / recent.len() as f64;
        let daily_projection = avg_per_bucket * buckets_per_day;

        let (slope, r_squared) = linear_regression(&recent);
        let trend = if daily_projection <= 0.0 {
            Trend::Stable
        } else {
            let daily_change = (slope * buckets_per_day).abs() / daily_projection;
            if daily_change < 0.05 {
                Trend::Stable
            } else if slope > 0.0 {
                Trend::Rising
            } else {
                Trend::Falling
            }
        };

        let days_until_exhaustion = match balance {
            Some(balance) if daily_projection > 0.0 => {
                Some((balance as f64 / daily_projection).round() as u64)
            }
            _ => None,
        };

        Some(Forecast {
            key: key.to_string(),
            daily_projection,
            trend,
            slope,
            r_squared,
            days_until_exhaustion,
            ema: entry.ema,
            buckets_analyzed: recent.len(),
        })
    }

    /// Compare recent spend against the EMA. Needs at least ten recorded
    /// points and a nonzero EMA; deviation is measured in standard
    /// deviations over the last 24 buckets.
    pub fn check_anomaly(&self, key: &str, recent_credits: f64) -> Option<Anomaly> {
        let usage = self.usage.read();
        let entry = usage.get(key)?;
        if entry.data_points < ANOMALY_MIN_POINTS || entry.ema == 0.0 {
            return None;
        }

        let values: Vec<f64> = entry
            .buckets
            .values()
            .rev()
            .take(ANOMALY_STDDEV_BUCKETS)
            .map(|c| *c as f64)
            .collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }

        let deviation = (recent_credits - entry.ema).abs() / std_dev;
        if deviation < self.config.anomaly_threshold {
            return None;
        }
        Some(Anomaly {
            key: key.to_string(),
            kind: if recent_credits > entry.ema {
                AnomalyKind::Spike
            } else {
                AnomalyKind::Drop
            },
            deviation,
            recent_credits,
            ema: entry.ema,
            timestamp: self.clock.now_ms(),
        })
    }

    pub fn ema(&self, key: &str) -> Option<f64> {
        self.usage.read().get(key).map(|u| u.ema)
    }

    pub fn bucket_count(&self, key: &str) -> usize {
        self.usage.read().get(key).map(|u| u.buckets.len()).unwrap_or(0)
    }
}

// Least squares over (index, credits); returns (slope, r_squared).
fn linear_regression(points: &[(u64, u64)]) -> (f64, f64) {
    let n = points.len() as f64;
    if points.len() < 2 {
        return (0.0, 0.0);
    }
    let xs: Vec<f64> = (0..points.len()).map(|i| i as f64).collect();
    let ys: Vec<f64> = points.iter().map(|(_, c)| *c as f64).collect();

    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    let mut ss_yy = 0.0;
    for i in 0..points.len() {
        let dx = xs[i] - mean_x;
        let dy = ys[i] - mean_y;
        ss_xy += dx * dy;
        ss_xx += dx * dx;
        ss_yy += dy * dy;
    }
    if ss_xx == 0.0 {
        return (0.0, 0.0);
    }
    let slope = ss_xy / ss_xx;
    let r_squared = if ss_yy == 0.0 {
        1.0
    } else {
        (ss_xy * ss_xy) / (ss_xx * ss_yy)
    };
    (slope, r_squared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const HOUR_MS: u64 = 3_600_000;

    fn engine() -> (UsageForecastEngine, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_700_000_000_000);
        (
            UsageForecastEngine::new(ForecastConfig::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_same_bucket_aggregates() {
        let (eng, clock) = engine();
        eng.record("k", 5);
        clock.advance(60_000);
        eng.record("k", 7);
        assert_eq!(eng.bucket_count("k"), 1);

        clock.advance(HOUR_MS);
        eng.record("k", 1);
        assert_eq!(eng.bucket_count("k"), 2);
    }

    #[test]
    fn test_ema_updates() {
        let (eng, _) = engine();
        eng.record("k", 10);
        assert!((eng.ema("k").unwrap() - 10.0).abs() < 1e-9);
        eng.record("k", 20);
        // 0.3 * 20 + 0.7 * 10 = 13
        assert!((eng.ema("k").unwrap() - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_forecast_stable_usage() {
        let (eng, clock) = engine();
        // 10 credits every hour for 48 hours.
        for _ in 0..48 {
            eng.record("k", 10);
            clock.advance(HOUR_MS);
        }
        let forecast = eng.forecast("k", Some(2_400)).unwrap();
        assert!((forecast.daily_projection - 240.0).abs() < 1.0);
        assert_eq!(forecast.trend, Trend::Stable);
        assert_eq!(forecast.days_until_exhaustion, Some(10));
    }

    #[test]
    fn test_forecast_rising_trend() {
        let (eng, clock) = engine();
        for i in 0..48u64 {
            eng.record("k", i * 10);
            clock.advance(HOUR_MS);
        }
        let forecast = eng.forecast("k", None).unwrap();
        assert_eq!(forecast.trend, Trend::Rising);
        assert!(forecast.slope > 0.0);
        assert!(forecast.r_squared > 0.9);
        assert!(forecast.days_until_exhaustion.is_none());
    }

    #[test]
    fn test_forecast_ignores_old_buckets() {
        let (eng, clock) = engine();
        eng.record("k", 1_000_000);
        // Ten days later the early spike is outside the window.
        clock.advance(10 * 24 * HOUR_MS);
        eng.record("k", 10);
        let forecast = eng.forecast("k", None).unwrap();
        assert_eq!(forecast.buckets_analyzed, 1);
        assert!((forecast.daily_projection - 240.0).abs() < 1.0);
    }

    #[test]
    fn test_forecast_unknown_key() {
        let (eng, _) = engine();
        assert!(eng.forecast("missing", None).is_none());
    }

    #[test]
    fn test_anomaly_requires_data() {
        let (eng, clock) = engine();
        for _ in 0..5 {
            eng.record("k", 10);
            clock.advance(HOUR_MS);
        }
        // Not enough data points yet.
        assert!(eng.check_anomaly("k", 10_000.0).is_none());
    }

    #[test]
    fn test_anomaly_spike_and_drop() {
        let (eng, clock) = engine();
        // Alternate to keep a nonzero stddev.
        for i in 0..24 {
            eng.record("k", if i % 2 == 0 { 10 } else { 14 });
            clock.advance(HOUR_MS);
        }
        let spike = eng.check_anomaly("k", 500.0).unwrap();
        assert_eq!(spike.kind, AnomalyKind::Spike);
        assert!(spike.deviation >= 3.0);

        let drop = eng.check_anomaly("k", 0.0).unwrap();
        assert_eq!(drop.kind, AnomalyKind::Drop);

        let calm = eng.check_anomaly("k", 12.0);
        assert!(calm.is_none());
    }

    #[test]
    fn test_anomaly_zero_stddev_returns_none() {
        let (eng, clock) = engine();
        for _ in 0..24 {
            eng.record("k", 10);
            clock.advance(HOUR_MS);
        }
        assert!(eng.check_anomaly("k", 10_000.0).is_none());
    }
}
