// Batch Credit Operations
//
// All-or-nothing batches of credit mutations. In atomic mode the balance
// map is snapshotted up front; any failure restores the snapshot and
// downgrades every previously-succeeded op to failed, so a rolled-back
// batch always reports zero successes.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use crate::keys::KeyStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const ROLLED_BACK: &str = "rolled back";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOpKind {
    Topup,
    Deduct,
    Transfer,
    Refund,
    Adjust,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOp {
    pub kind: BatchOpKind,
    /// Target key; the source key for transfers.
    pub key: String,
    /// Destination key, transfers only.
    #[serde(default)]
    pub to_key: Option<String>,
    /// Signed for adjust; positive for every other kind.
    pub amount: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOpResult {
    pub index: usize,
    pub kind: BatchOpKind,
    pub key: String,
    pub success: bool,
    pub message: Option<String>,
    pub balance_before: Option<u64>,
    pub balance_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchExecutionResult {
    pub id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub rolled_back: bool,
    pub results: Vec<BatchOpResult>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_ops_per_batch: usize,
    pub allow_overdraft: bool,
    pub max_history: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_ops_per_batch: 100,
            allow_overdraft: false,
            max_history: 100,
        }
    }
}

pub struct BatchCreditManager {
    history: RwLock<VecDeque<BatchExecutionResult>>,
    store: Arc<KeyStore>,
    config: BatchConfig,
    clock: SharedClock,
}

impl BatchCreditManager {
    pub fn new(config: BatchConfig, store: Arc<KeyStore>, clock: SharedClock) -> Self {
        Self {
            history: RwLock::new(VecDeque::new()),
            store,
            config,
            clock,
        }
    }

    pub fn execute(&self, ops: Vec<BatchOp>, atomic: bool) -> BatchExecutionResult {
        let now = self.clock.now_ms();
        let id = Uuid::new_v4().to_string();

        if ops.is_empty() {
            return self.record(BatchExecutionResult {
                id,
                succeeded: 0,
                failed: 0,
                rolled_back: false,
                results: Vec::new(),
                timestamp: now,
            });
        }

        if ops.len() > self.config.max_ops_per_batch {
            warn!(count = ops.len(), "batch over size limit");
            let results = ops
                .iter()
                .enumerate()
                .map(|(index, op)| BatchOpResult {
                    index,
                    kind: op.kind,
                    key: op.key.clone(),
                    success: false,
                    message: Some(format!(
                        "batch exceeds {} ops",
                        self.config.max_ops_per_batch
                    )),
                    balance_before: None,
                    balance_after: None,
                })
                .collect();
            let failed = ops.len();
            return self.record(BatchExecutionResult {
                id,
                succeeded: 0,
                failed,
                rolled_back: false,
                results,
                timestamp: now,
            });
        }

        let snapshot = self.store.balances_snapshot();

        // Upfront validation: in atomic mode a single invalid op fails the
        // whole batch before any balance moves.
        let validation: Vec<Option<String>> =
            ops.iter().map(|op| self.validate_op(op).err().map(|e| e.to_string())).collect();
        if atomic && validation.iter().any(|v| v.is_some()) {
            let results = ops
                .iter()
                .enumerate()
                .map(|(index, op)| BatchOpResult {
                    index,
                    kind: op.kind,
                    key: op.key.clone(),
                    success: false,
                    message: Some(
                        validation[index]
                            .clone()
                            .unwrap_or_else(|| ROLLED_BACK.to_string()),
                    ),
                    balance_before: self.store.balance(&op.key),
                    balance_after: self.store.balance(&op.key),
                })
                .collect();
            let failed = ops.len();
            return self.record(BatchExecutionResult {
                id,
                succeeded: 0,
                failed,
                rolled_back: true,
                results,
                timestamp: now,
            });
        }

        let mut results: Vec<BatchOpResult> = Vec::with_capacity(ops.len());
        let mut rolled_back = false;

        for (index, op) in ops.iter().enumerate() {
            if let Some(message) = &validation[index] {
                results.push(BatchOpResult {
                    index,
                    kind: op.kind,
                    key: op.key.clone(),
                    success: false,
                    message: Some(message.clone()),
                    balance_before: self.store.balance(&op.key),
                    balance_after: self.store.balance(&op.key),
                });
                continue;
            }

            let before = self.store.balance(&op.key);
            match self.apply_op(op) {
                Ok(()) => {
                    results.push(BatchOpResult {
                        index,
                        kind: op.kind,
                        key: op.key.clone(),
                        success: true,
                        message: None,
                        balance_before: before,
                        balance_after: self.store.balance(&op.key),
                    });
                }
                Err(e) => {
                    results.push(BatchOpResult {
                        index,
                        kind: op.kind,
                        key: op.key.clone(),
                        success: false,
                        message: Some(e.to_string()),
                        balance_before: before,
                        balance_after: before,
                    });

                    if atomic {
                        // Restore the snapshot, mark the unexecuted tail as
                        // rolled back, and downgrade earlier successes so
                        // the batch reports zero successes.
                        self.store.restore_balances(&snapshot);
                        rolled_back = true;
                        for result in results.iter_mut().filter(|r| r.success) {
                            result.success = false;
                            result.message = Some(ROLLED_BACK.to_string());
                        }
                        for (tail_index, tail_op) in ops.iter().enumerate().skip(index + 1) {
                            results.push(BatchOpResult {
                                index: tail_index,
                                kind: tail_op.kind,
                                key: tail_op.key.clone(),
                                success: false,
                                message: Some(ROLLED_BACK.to_string()),
                                balance_before: self.store.balance(&tail_op.key),
                                balance_after: self.store.balance(&tail_op.key),
                            });
                        }
                        break;
                    }
                }
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.len() - succeeded;
        info!(succeeded, failed, rolled_back, "batch executed");
        self.record(BatchExecutionResult {
            id,
            succeeded,
            failed,
            rolled_back,
            results,
            timestamp: now,
        })
    }

    pub fn history(&self, limit: usize) -> Vec<BatchExecutionResult> {
        self.history.read().iter().rev().take(limit).cloned().collect()
    }

    fn validate_op(&self, op: &BatchOp) -> Result<()> {
        if op.key.is_empty() {
            return Err(GateError::Validation("op key is required".to_string()));
        }
        match op.kind {
            BatchOpKind::Adjust => {
                if op.amount == 0 {
                    return Err(GateError::Validation(
                        "adjust amount must be nonzero".to_string(),
                    ));
                }
                if op.reason.as_deref().unwrap_or("").is_empty() {
                    return Err(GateError::Validation(
                        "adjust requires a reason".to_string(),
                    ));
                }
            }
            BatchOpKind::Transfer => {
                if op.amount <= 0 {
                    return Err(GateError::Validation(
                        "transfer amount must be positive".to_string(),
                    ));
                }
                match &op.to_key {
                    Some(to) if !to.is_empty() && to != &op.key => {}
                    _ => {
                        return Err(GateError::Validation(
                            "transfer requires a distinct destination key".to_string(),
                        ))
                    }
                }
            }
            _ => {
                if op.amount <= 0 {
                    return Err(GateError::Validation(
                        "amount must be positive".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn apply_op(&self, op: &BatchOp) -> Result<()> {
        match op.kind {
            BatchOpKind::Topup | BatchOpKind::Refund => {
                self.store.add_credits(&op.key, op.amount as u64)?;
                Ok(())
            }
            BatchOpKind::Deduct => {
                self.store
                    .charge_credits(&op.key, op.amount as u64, self.config.allow_overdraft)?;
                Ok(())
            }
            BatchOpKind::Transfer => {
                let to = op.to_key.as_deref().unwrap_or_default();
                self.store.transfer_credits(
                    &op.key,
                    to,
                    op.amount as u64,
                    self.config.allow_overdraft,
                )
            }
            BatchOpKind::Adjust => {
                if op.amount > 0 {
                    self.store.add_credits(&op.key, op.amount as u64)?;
                } else {
                    self.store.charge_credits(
                        &op.key,
                        op.amount.unsigned_abs(),
                        self.config.allow_overdraft,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn record(&self, result: BatchExecutionResult) -> BatchExecutionResult {
        let mut history = self.history.write();
        history.push_back(result.clone());
        while history.len() > self.config.max_history {
            history.pop_front();
        }
        result
    }
}
