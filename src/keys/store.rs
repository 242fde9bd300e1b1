// Key Store
//
// Single source of truth for API key records: balances, quota counters,
// ACLs, expiry and spending limits. All credit mutation goes through here.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use crate::persist::StateFile;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-key quota counters. Daily/monthly windows reset lazily when the
/// stored UTC date strings no longer match the current day or month.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaCounters {
    #[serde(default)]
    pub daily_call_limit: Option<u64>,
    #[serde(default)]
    pub monthly_call_limit: Option<u64>,
    #[serde(default)]
    pub daily_credit_limit: Option<u64>,
    #[serde(default)]
    pub monthly_credit_limit: Option<u64>,
    #[serde(default)]
    pub daily_calls: u64,
    #[serde(default)]
    pub monthly_calls: u64,
    #[serde(default)]
    pub daily_credits: u64,
    #[serde(default)]
    pub monthly_credits: u64,
    #[serde(default)]
    pub last_daily_reset: String,
    #[serde(default)]
    pub last_monthly_reset: String,
}

/// A stored API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub name: String,
    pub credits: u64,
    #[serde(default)]
    pub total_spent: u64,
    #[serde(default)]
    pub total_calls: u64,
    pub created_at: u64,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub spending_limit: Option<u64>,
    /// Empty means all tools are allowed (subject to `denied_tools`).
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub quota: QuotaCounters,
    #[serde(default)]
    pub overdraft_enabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_active() -> bool {
    true
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at, Some(t) if now_ms >= t)
    }

    /// Tool-level ACL: deny list wins, then a non-empty allow list must
    /// contain the tool.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if self.denied_tools.iter().any(|t| t == tool) {
            return false;
        }
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateKeyOptions {
    pub expires_at: Option<u64>,
    pub spending_limit: Option<u64>,
    pub allowed_tools: Vec<String>,
    pub denied_tools: Vec<String>,
    pub overdraft_enabled: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStoreConfig {
    /// Prefix for generated keys: `<prefix>_<hex>`.
    pub key_prefix: String,
    /// Entropy of the generated key material, in bytes. 24 bytes = 192 bits.
    pub key_entropy_bytes: usize,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tg".to_string(),
            key_entropy_bytes: 24,
        }
    }
}

pub struct KeyStore {
    keys: RwLock<HashMap<String, ApiKeyRecord>>,
    config: KeyStoreConfig,
    clock: SharedClock,
    persist: Option<Arc<StateFile>>,
}

impl KeyStore {
    pub fn new(config: KeyStoreConfig, clock: SharedClock) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            config,
            clock,
            persist: None,
        }
    }

    /// Attach a state file; every mutation snapshots to it, best-effort.
    pub fn with_persistence(mut self, persist: Arc<StateFile>) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Load previously persisted records, replacing current contents.
    pub fn load_records(&self, records: Vec<(String, ApiKeyRecord)>) {
        let mut keys = self.keys.write();
        keys.clear();
        for (key, record) in records {
            keys.insert(key, record);
        }
        info!(count = keys.len(), "loaded key records");
    }

    /// Create a new key. Credits are floored and clamped at zero; the name
    /// is reduced to printable characters and capped at 200 chars.
    pub fn create_key(
        &self,
        name: &str,
        initial_credits: i64,
        options: CreateKeyOptions,
    ) -> ApiKeyRecord {
        let key = self.generate_key();
        let now = self.clock.now_ms();
        let record = ApiKeyRecord {
            key: key.clone(),
            name: sanitize_name(name),
            credits: initial_credits.max(0) as u64,
            total_spent: 0,
            total_calls: 0,
            created_at: now,
            last_used_at: None,
            active: true,
            expires_at: options.expires_at,
            spending_limit: options.spending_limit,
            allowed_tools: options.allowed_tools,
            denied_tools: options.denied_tools,
            quota: QuotaCounters::default(),
            overdraft_enabled: options.overdraft_enabled,
            metadata: options.metadata,
        };

        self.keys.write().insert(key.clone(), record.clone());
        info!(key = %redact(&key), name = %record.name, credits = record.credits, "created key");
        self.save();
        record
    }

    /// Register an externally supplied record (state import, rotation).
    pub fn import_key(&self, record: ApiKeyRecord) -> Result<()> {
        if record.key.is_empty() {
            return Err(GateError::Validation("key must not be empty".to_string()));
        }
        let mut keys = self.keys.write();
        if keys.contains_key(&record.key) {
            return Err(GateError::AlreadyExists(format!(
                "key {} already exists",
                redact(&record.key)
            )));
        }
        keys.insert(record.key.clone(), record);
        drop(keys);
        self.save();
        Ok(())
    }

    /// Fetch a key record, hiding inactive and expired keys. Quota windows
    /// are lazily reset as a side effect.
    pub fn get_key(&self, key: &str) -> Option<ApiKeyRecord> {
        let now = self.clock.now_ms();
        let (today, month) = self.date_strings();
        let mut keys = self.keys.write();
        let record = keys.get_mut(key)?;
        if !record.active || record.is_expired(now) {
            return None;
        }
        reset_quota_if_stale(&mut record.quota, &today, &month);
        Some(record.clone())
    }

    /// Fetch a key record regardless of active/expiry state.
    pub fn get_key_raw(&self, key: &str) -> Option<ApiKeyRecord> {
        self.keys.read().get(key).cloned()
    }

    /// Atomically deduct credits for one call. Returns false when the key is
    /// unknown or the balance (or spending limit) cannot cover the amount;
    /// on success also bumps totals, quota counters and last-used.
    pub fn deduct_credits(&self, key: &str, amount: u64) -> bool {
        let now = self.clock.now_ms();
        let (today, month) = self.date_strings();
        let charged = {
            let mut keys = self.keys.write();
            let record = match keys.get_mut(key) {
                Some(r) => r,
                None => return false,
            };

            if record.credits < amount && !record.overdraft_enabled {
                debug!(key = %redact(key), amount, credits = record.credits, "deduct rejected");
                return false;
            }
            if let Some(limit) = record.spending_limit {
                if record.total_spent + amount > limit {
                    debug!(key = %redact(key), amount, limit, "spending limit reached");
                    return false;
                }
            }

            record.credits = record.credits.saturating_sub(amount);
            record.total_spent += amount;
            record.total_calls += 1;
            record.last_used_at = Some(now);
            reset_quota_if_stale(&mut record.quota, &today, &month);
            record.quota.daily_calls += 1;
            record.quota.monthly_calls += 1;
            record.quota.daily_credits += amount;
            record.quota.monthly_credits += amount;
            true
        };
        if charged {
            self.save();
        }
        charged
    }

    /// Deduct credits without touching call counters. Used for
    /// administrative charges and connection billing.
    pub fn charge_credits(&self, key: &str, amount: u64, allow_overdraft: bool) -> Result<u64> {
        let balance = {
            let mut keys = self.keys.write();
            let record = keys
                .get_mut(key)
                .ok_or_else(|| GateError::NotFound(format!("key {}", redact(key))))?;
            if record.credits < amount && !allow_overdraft && !record.overdraft_enabled {
                return Err(GateError::InsufficientCredits(format!(
                    "balance {} < {}",
                    record.credits, amount
                )));
            }
            record.credits = record.credits.saturating_sub(amount);
            record.credits
        };
        self.save();
        Ok(balance)
    }

    /// Add credits to a key. Zero amounts are rejected.
    pub fn add_credits(&self, key: &str, amount: u64) -> Result<u64> {
        if amount == 0 {
            return Err(GateError::Validation("amount must be positive".to_string()));
        }
        let balance = {
            let mut keys = self.keys.write();
            let record = keys
                .get_mut(key)
                .ok_or_else(|| GateError::NotFound(format!("key {}", redact(key))))?;
            record.credits += amount;
            record.credits
        };
        self.save();
        Ok(balance)
    }

    /// Atomic two-key balance move, used by the transfer manager.
    pub fn transfer_credits(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        allow_overdraft: bool,
    ) -> Result<()> {
        {
            let mut keys = self.keys.write();
            if !keys.contains_key(to) {
                return Err(GateError::NotFound(format!("key {}", redact(to))));
            }
            let source = keys
                .get_mut(from)
                .ok_or_else(|| GateError::NotFound(format!("key {}", redact(from))))?;
            if source.credits < amount && !allow_overdraft {
                return Err(GateError::InsufficientCredits(format!(
                    "balance {} < {}",
                    source.credits, amount
                )));
            }
            source.credits = source.credits.saturating_sub(amount);
            let dest = keys.get_mut(to).expect("checked above");
            dest.credits += amount;
        }
        self.save();
        Ok(())
    }

    /// Current balance of a key, if known.
    pub fn balance(&self, key: &str) -> Option<u64> {
        self.keys.read().get(key).map(|r| r.credits)
    }

    /// Snapshot of every balance, for batch rollback.
    pub fn balances_snapshot(&self) -> HashMap<String, u64> {
        self.keys
            .read()
            .iter()
            .map(|(k, r)| (k.clone(), r.credits))
            .collect()
    }

    /// Restore balances from a snapshot. Keys created after the snapshot
    /// keep their current balance.
    pub fn restore_balances(&self, snapshot: &HashMap<String, u64>) {
        {
            let mut keys = self.keys.write();
            for (key, credits) in snapshot {
                if let Some(record) = keys.get_mut(key) {
                    record.credits = *credits;
                }
            }
        }
        self.save();
    }

    /// Enforce quota limits for one prospective call of the given cost.
    pub fn check_quota(&self, key: &str, cost: u64) -> Result<()> {
        let (today, month) = self.date_strings();
        let mut keys = self.keys.write();
        let record = keys
            .get_mut(key)
            .ok_or_else(|| GateError::NotFound(format!("key {}", redact(key))))?;
        reset_quota_if_stale(&mut record.quota, &today, &month);

        let q = &record.quota;
        if let Some(limit) = q.daily_call_limit {
            if q.daily_calls >= limit {
                return Err(GateError::PolicyDenied("daily call quota exceeded".to_string()));
            }
        }
        if let Some(limit) = q.monthly_call_limit {
            if q.monthly_calls >= limit {
                return Err(GateError::PolicyDenied("monthly call quota exceeded".to_string()));
            }
        }
        if let Some(limit) = q.daily_credit_limit {
            if q.daily_credits + cost > limit {
                return Err(GateError::PolicyDenied("daily credit quota exceeded".to_string()));
            }
        }
        if let Some(limit) = q.monthly_credit_limit {
            if q.monthly_credits + cost > limit {
                return Err(GateError::PolicyDenied(
                    "monthly credit quota exceeded".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn set_acl(&self, key: &str, allowed: Vec<String>, denied: Vec<String>) -> Result<()> {
        self.mutate(key, |record| {
            record.allowed_tools = allowed;
            record.denied_tools = denied;
        })
    }

    pub fn set_quota(
        &self,
        key: &str,
        daily_calls: Option<u64>,
        monthly_calls: Option<u64>,
        daily_credits: Option<u64>,
        monthly_credits: Option<u64>,
    ) -> Result<()> {
        self.mutate(key, |record| {
            record.quota.daily_call_limit = daily_calls;
            record.quota.monthly_call_limit = monthly_calls;
            record.quota.daily_credit_limit = daily_credits;
            record.quota.monthly_credit_limit = monthly_credits;
        })
    }

    pub fn set_expiry(&self, key: &str, expires_at: Option<u64>) -> Result<()> {
        self.mutate(key, |record| {
            record.expires_at = expires_at;
        })
    }

    pub fn set_spending_limit(&self, key: &str, limit: Option<u64>) -> Result<()> {
        self.mutate(key, |record| {
            record.spending_limit = limit;
        })
    }

    /// Soft revocation. The record stays for audit but is invisible to
    /// `get_key`.
    pub fn revoke_key(&self, key: &str) -> Result<()> {
        let result = self.mutate(key, |record| {
            record.active = false;
        });
        if result.is_ok() {
            info!(key = %redact(key), "revoked key");
        }
        result
    }

    /// Hard delete.
    pub fn delete_key(&self, key: &str) -> Result<()> {
        let removed = self.keys.write().remove(key).is_some();
        if !removed {
            return Err(GateError::NotFound(format!("key {}", redact(key))));
        }
        self.save();
        Ok(())
    }

    /// All records, inactive included.
    pub fn list_keys(&self) -> Vec<ApiKeyRecord> {
        self.keys.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn mutate<F: FnOnce(&mut ApiKeyRecord)>(&self, key: &str, f: F) -> Result<()> {
        {
            let mut keys = self.keys.write();
            let record = keys
                .get_mut(key)
                .ok_or_else(|| GateError::NotFound(format!("key {}", redact(key))))?;
            f(record);
        }
        self.save();
        Ok(())
    }

    fn generate_key(&self) -> String {
        use rand::RngCore;
        let mut bytes = vec![0u8; self.config.key_entropy_bytes.max(24)];
        rand::rng().fill_bytes(&mut bytes);
        format!("{}_{}", self.config.key_prefix, hex::encode(bytes))
    }

    fn date_strings(&self) -> (String, String) {
        let wall = self.clock.wall();
        (wall.format("%Y-%m-%d").to_string(), wall.format("%Y-%m").to_string())
    }

    // Snapshot outside the lock; writing is best-effort.
    fn save(&self) {
        if let Some(persist) = &self.persist {
            let records: Vec<(String, ApiKeyRecord)> = self
                .keys
                .read()
                .iter()
                .map(|(k, r)| (k.clone(), r.clone()))
                .collect();
            persist.save_keys(&records);
        }
    }
}

fn reset_quota_if_stale(quota: &mut QuotaCounters, today: &str, month: &str) {
    if quota.last_daily_reset != today {
        quota.daily_calls = 0;
        quota.daily_credits = 0;
        quota.last_daily_reset = today.to_string();
    }
    if quota.last_monthly_reset != month {
        quota.monthly_calls = 0;
        quota.monthly_credits = 0;
        quota.last_monthly_reset = month.to_string();
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .take(200)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keys are secrets; logs only ever carry a short prefix.
pub fn redact(key: &str) -> String {
    if key.len() <= 8 {
        key.to_string()
    } else {
        format!("{}…", &key[..8])
    }
}
