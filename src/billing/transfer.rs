// Credit Transfers
//
// Atomic balance moves between two keys, with a bounded audit history.
// A transfer can be reversed exactly once; the reversal is itself a new
// record wired back to the original.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use crate::keys::KeyStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub min_amount: u64,
    pub max_amount: u64,
    pub allow_overdraft: bool,
    pub max_history: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_amount: 1,
            max_amount: 1_000_000,
            allow_overdraft: false,
            max_history: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub id: String,
    pub from_key: String,
    pub to_key: String,
    pub amount: u64,
    pub reason: Option<String>,
    pub timestamp: u64,
    pub reversed_at: Option<u64>,
    pub reversal_id: Option<String>,
    /// Set when this record is itself a reversal.
    pub reversal_of: Option<String>,
}

pub struct CreditTransferManager {
    history: RwLock<VecDeque<TransferRecord>>,
    store: Arc<KeyStore>,
    config: TransferConfig,
    clock: SharedClock,
}

impl CreditTransferManager {
    pub fn new(config: TransferConfig, store: Arc<KeyStore>, clock: SharedClock) -> Self {
        Self {
            history: RwLock::new(VecDeque::new()),
            store,
            config,
            clock,
        }
    }

    pub fn transfer(
        &self,
        from_key: &str,
        to_key: &str,
        amount: u64,
        reason: Option<&str>,
    ) -> Result<TransferRecord> {
        self.validate(from_key, to_key, amount)?;
        self.store
            .transfer_credits(from_key, to_key, amount, self.config.allow_overdraft)?;
        let record = self.push_record(from_key, to_key, amount, reason, None);
        info!(transfer = %record.id, amount, "credits transferred");
        Ok(record)
    }

    /// Reverse a transfer by moving the amount back. Each transfer can be
    /// reversed once.
    pub fn reverse(&self, transfer_id: &str, reason: Option<&str>) -> Result<TransferRecord> {
        let original = {
            let history = self.history.read();
            history
                .iter()
                .find(|r| r.id == transfer_id)
                .cloned()
                .ok_or_else(|| GateError::NotFound(format!("transfer {}", transfer_id)))?
        };
        if original.reversed_at.is_some() {
            return Err(GateError::InvalidState(format!(
                "transfer {} already reversed",
                transfer_id
            )));
        }

        // Reversals always move the money back, overdraft rules aside.
        self.store
            .transfer_credits(&original.to_key, &original.from_key, original.amount, true)?;
        let reversal = self.push_record(
            &original.to_key,
            &original.from_key,
            original.amount,
            reason,
            Some(transfer_id),
        );

        let now = self.clock.now_ms();
        let mut history = self.history.write();
        if let Some(record) = history.iter_mut().find(|r| r.id == transfer_id) {
            record.reversed_at = Some(now);
            record.reversal_id = Some(reversal.id.clone());
        }
        Ok(reversal)
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.history
            .read()
            .iter()
            .find(|r| r.id == transfer_id)
            .cloned()
    }

    /// Most recent transfers first.
    pub fn history(&self, limit: usize) -> Vec<TransferRecord> {
        self.history
            .read()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn history_for_key(&self, key: &str, limit: usize) -> Vec<TransferRecord> {
        self.history
            .read()
            .iter()
            .rev()
            .filter(|r| r.from_key == key || r.to_key == key)
            .take(limit)
            .cloned()
            .collect()
    }

    fn validate(&self, from_key: &str, to_key: &str, amount: u64) -> Result<()> {
        if from_key.is_empty() || to_key.is_empty() {
            return Err(GateError::Validation("keys must not be empty".to_string()));
        }
        if from_key == to_key {
            return Err(GateError::Validation(
                "cannot transfer to the same key".to_string(),
            ));
        }
        if amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(GateError::Validation(format!(
                "amount must be within [{}, {}]",
                self.config.min_amount, self.config.max_amount
            )));
        }
        if self.store.balance(from_key).is_none() {
            return Err(GateError::NotFound("source key".to_string()));
        }
        if self.store.balance(to_key).is_none() {
            return Err(GateError::NotFound("destination key".to_string()));
        }
        Ok(())
    }

    fn push_record(
        &self,
        from_key: &str,
        to_key: &str,
        amount: u64,
        reason: Option<&str>,
        reversal_of: Option<&str>,
    ) -> TransferRecord {
        let record = TransferRecord {
            id: Uuid::new_v4().to_string(),
            from_key: from_key.to_string(),
            to_key: to_key.to_string(),
            amount,
            reason: reason.map(|r| r.to_string()),
            timestamp: self.clock.now_ms(),
            reversed_at: None,
            reversal_id: None,
            reversal_of: reversal_of.map(|r| r.to_string()),
        };
        let mut history = self.history.write();
        history.push_back(record.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
        record
    }
}
