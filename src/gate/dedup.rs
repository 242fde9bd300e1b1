// Request Deduplication
//
// Short-circuits duplicate work by fingerprinting the canonicalized request
// payload. Records expire after a TTL; expiry is pruned lazily on access,
// and when the map is full with nothing expired the oldest record (by first
// sighting) is evicted.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintAlgorithm {
    /// Collision-resistant; the default.
    Sha256,
    /// Cheap 64-bit hash for high-volume, low-stakes dedup.
    Fnv1a,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
    pub algorithm: FingerprintAlgorithm,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_entries: 10_000,
            algorithm: FingerprintAlgorithm::Sha256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupRecord {
    pub fingerprint: String,
    pub key: String,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub count: u64,
    pub expires_at: u64,
}

pub struct RequestDeduplicator {
    records: RwLock<HashMap<String, DedupRecord>>,
    config: DedupConfig,
    clock: SharedClock,
}

impl RequestDeduplicator {
    pub fn new(config: DedupConfig, clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Stable hash over the sorted key/value projection of a payload.
    pub fn fingerprint(&self, payload: &Value) -> String {
        let canonical = canonicalize(payload);
        match self.config.algorithm {
            FingerprintAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(canonical.as_bytes());
                hex::encode(hasher.finalize())
            }
            FingerprintAlgorithm::Fnv1a => {
                format!("{:016x}", fnv1a64(canonical.as_bytes()))
            }
        }
    }

    /// Whether an unexpired record exists for the fingerprint.
    pub fn is_duplicate(&self, fingerprint: &str) -> bool {
        let now = self.clock.now_ms();
        let mut records = self.records.write();
        match records.get(fingerprint) {
            Some(record) if record.expires_at > now => true,
            Some(_) => {
                records.remove(fingerprint);
                false
            }
            None => false,
        }
    }

    /// Upsert a sighting and refresh its expiry to `now + ttl`.
    pub fn record(&self, fingerprint: &str, key: &str) -> DedupRecord {
        let now = self.clock.now_ms();
        let mut records = self.records.write();

        if let Some(record) = records.get_mut(fingerprint) {
            if record.expires_at > now {
                record.count += 1;
                record.last_seen_at = now;
                record.expires_at = now + self.config.ttl_ms;
                return record.clone();
            }
            records.remove(fingerprint);
        }

        if records.len() >= self.config.max_entries {
            Self::make_room(&mut records, now);
        }

        let record = DedupRecord {
            fingerprint: fingerprint.to_string(),
            key: key.to_string(),
            first_seen_at: now,
            last_seen_at: now,
            count: 1,
            expires_at: now + self.config.ttl_ms,
        };
        records.insert(fingerprint.to_string(), record.clone());
        record
    }

    pub fn get_record(&self, fingerprint: &str) -> Option<DedupRecord> {
        let now = self.clock.now_ms();
        self.records
            .read()
            .get(fingerprint)
            .filter(|r| r.expires_at > now)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    // Prefer dropping expired records; otherwise evict the record with the
    // earliest first sighting.
    fn make_room(records: &mut HashMap<String, DedupRecord>, now: u64) {
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(fp, _)| fp.clone())
            .collect();
        if !expired.is_empty() {
            for fp in expired {
                records.remove(&fp);
            }
            return;
        }
        if let Some(oldest) = records
            .values()
            .min_by_key(|r| r.first_seen_at)
            .map(|r| r.fingerprint.clone())
        {
            records.remove(&oldest);
        }
    }
}

// Objects are rebuilt with sorted keys so logically-equal payloads hash
// identically regardless of construction order.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn dedup(ttl_ms: u64, max_entries: usize) -> (RequestDeduplicator, Arc<ManualClock>) {
        let clock = ManualClock::shared(1_000);
        let config = DedupConfig {
            ttl_ms,
            max_entries,
            algorithm: FingerprintAlgorithm::Sha256,
        };
        (RequestDeduplicator::new(config, clock.clone()), clock)
    }

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let (dd, _) = dedup(1_000, 10);
        let a = dd.fingerprint(&json!({"tool": "search", "args": {"q": "x", "n": 1}}));
        let b = dd.fingerprint(&json!({"args": {"n": 1, "q": "x"}, "tool": "search"}));
        assert_eq!(a, b);

        let c = dd.fingerprint(&json!({"tool": "search", "args": {"q": "y", "n": 1}}));
        assert_ne!(a, c);
    }

    #[test]
    fn test_fnv_algorithm_differs_but_is_stable() {
        let clock = ManualClock::shared(0);
        let fast = RequestDeduplicator::new(
            DedupConfig {
                algorithm: FingerprintAlgorithm::Fnv1a,
                ..Default::default()
            },
            clock,
        );
        let payload = json!({"a": 1});
        let fp = fast.fingerprint(&payload);
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fast.fingerprint(&payload));
    }

    #[test]
    fn test_duplicate_within_ttl() {
        let (dd, clock) = dedup(1_000, 10);
        let fp = dd.fingerprint(&json!({"a": 1}));

        assert!(!dd.is_duplicate(&fp));
        dd.record(&fp, "k1");
        assert!(dd.is_duplicate(&fp));

        clock.advance(999);
        assert!(dd.is_duplicate(&fp));
        clock.advance(1);
        assert!(!dd.is_duplicate(&fp));
    }

    #[test]
    fn test_record_refreshes_expiry_and_counts() {
        let (dd, clock) = dedup(1_000, 10);
        dd.record("fp", "k1");
        clock.advance(800);
        let record = dd.record("fp", "k1");
        assert_eq!(record.count, 2);
        assert_eq!(record.first_seen_at, 1_000);
        assert_eq!(record.last_seen_at, 1_800);

        // Refreshed: still alive past the original expiry.
        clock.advance(800);
        assert!(dd.is_duplicate("fp"));
    }

    #[test]
    fn test_capacity_evicts_expired_first() {
        let (dd, clock) = dedup(100, 2);
        dd.record("a", "k");
        clock.advance(150); // "a" expires
        dd.record("b", "k");
        dd.record("c", "k"); // room made by dropping expired "a"
        assert!(dd.get_record("a").is_none());
        assert!(dd.get_record("b").is_some());
        assert!(dd.get_record("c").is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest_when_nothing_expired() {
        let (dd, clock) = dedup(10_000, 2);
        dd.record("a", "k");
        clock.advance(10);
        dd.record("b", "k");
        clock.advance(10);
        dd.record("c", "k");
        assert_eq!(dd.len(), 2);
        assert!(dd.get_record("a").is_none());
        assert!(dd.get_record("c").is_some());
    }
}
