// Billing Cycles & Invoices
//
// Each subscribed key has a rolling cycle (daily, weekly or monthly in UTC
// calendar terms). Cycles advance lazily until they contain now; invoices
// aggregate the usage recorded inside the current cycle, grouped by tool.
// Invoice status walks draft -> finalized -> paid, with voiding allowed
// from any non-paid state.

use crate::clock::SharedClock;
use crate::error::{GateError, Result};
use chrono::{DateTime, Days, Months, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSubscription {
    pub key: String,
    pub frequency: BillingFrequency,
    pub cycle_start: u64,
    pub cycle_end: u64,
    pub active: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub key: String,
    pub tool: String,
    pub credits: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Paid,
    Voided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub tool: String,
    pub call_count: u64,
    pub total_credits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub key: String,
    pub status: InvoiceStatus,
    pub cycle_start: u64,
    pub cycle_end: u64,
    pub line_items: Vec<InvoiceLineItem>,
    pub total_credits: u64,
    pub total_calls: u64,
    pub created_at: u64,
    pub finalized_at: Option<u64>,
    pub paid_at: Option<u64>,
    pub voided_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCycleConfig {
    /// Usage records older than this are dropped on insert.
    pub max_usage_records: usize,
}

impl Default for BillingCycleConfig {
    fn default() -> Self {
        Self {
            max_usage_records: 500_000,
        }
    }
}

pub struct BillingCycleManager {
    subscriptions: RwLock<HashMap<String, BillingSubscription>>,
    usage: RwLock<Vec<UsageRecord>>,
    invoices: RwLock<HashMap<String, Invoice>>,
    total_credits_invoiced: RwLock<u64>,
    config: BillingCycleConfig,
    clock: SharedClock,
}

impl BillingCycleManager {
    pub fn new(config: BillingCycleConfig, clock: SharedClock) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            usage: RwLock::new(Vec::new()),
            invoices: RwLock::new(HashMap::new()),
            total_credits_invoiced: RwLock::new(0),
            config,
            clock,
        }
    }

    pub fn subscribe(&self, key: &str, frequency: BillingFrequency) -> Result<BillingSubscription> {
        let now = self.clock.now_ms();
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(key) {
            return Err(GateError::AlreadyExists(
                "billing subscription for key".to_string(),
            ));
        }
        let subscription = BillingSubscription {
            key: key.to_string(),
            frequency,
            cycle_start: now,
            cycle_end: advance_one(now, frequency),
            active: true,
            created_at: now,
        };
        subscriptions.insert(key.to_string(), subscription.clone());
        Ok(subscription)
    }

    pub fn cancel(&self, key: &str) -> Result<()> {
        let removed = self.subscriptions.write().remove(key).is_some();
        if removed {
            Ok(())
        } else {
            Err(GateError::NotFound("subscription for key".to_string()))
        }
    }

    pub fn set_active(&self, key: &str, active: bool) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions
            .get_mut(key)
            .ok_or_else(|| GateError::NotFound("subscription for key".to_string()))?;
        subscription.active = active;
        Ok(())
    }

    /// Subscription with its cycle lazily advanced to contain now.
    pub fn get_subscription(&self, key: &str) -> Option<BillingSubscription> {
        let now = self.clock.now_ms();
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions.get_mut(key)?;
        advance_until_contains(subscription, now);
        Some(subscription.clone())
    }

    /// Record usage for later invoicing.
    pub fn record_usage(&self, key: &str, tool: &str, credits: u64) {
        let mut usage = self.usage.write();
        usage.push(UsageRecord {
            key: key.to_string(),
            tool: tool.to_string(),
            credits,
            timestamp: self.clock.now_ms(),
        });
        let excess = usage.len().saturating_sub(self.config.max_usage_records);
        if excess > 0 {
            usage.drain(..excess);
        }
    }

    /// Draft an invoice for the key's current cycle. Line items are grouped
    /// by tool and sorted by descending credits.
    pub fn generate_invoice(&self, key: &str) -> Result<Invoice> {
        let now = self.clock.now_ms();
        let (cycle_start, cycle_end) = {
            let mut subscriptions = self.subscriptions.write();
            let subscription = subscriptions
                .get_mut(key)
                .ok_or_else(|| GateError::NotFound("subscription for key".to_string()))?;
            if !subscription.active {
                return Err(GateError::InvalidState(
                    "subscription is paused".to_string(),
                ));
            }
            advance_until_contains(subscription, now);
            (subscription.cycle_start, subscription.cycle_end)
        };

        let mut by_tool: HashMap<String, InvoiceLineItem> = HashMap::new();
        for record in self.usage.read().iter() {
            if record.key != key || record.timestamp < cycle_start || record.timestamp > cycle_end {
                continue;
            }
            let item = by_tool
                .entry(record.tool.clone())
                .or_insert_with(|| InvoiceLineItem {
                    tool: record.tool.clone(),
                    call_count: 0,
                    total_credits: 0,
                });
            item.call_count += 1;
            item.total_credits += record.credits;
        }

        let mut line_items: Vec<InvoiceLineItem> = by_tool.into_values().collect();
        line_items.sort_by(|a, b| b.total_credits.cmp(&a.total_credits));
        let total_credits = line_items.iter().map(|i| i.total_credits).sum();
        let total_calls = line_items.iter().map(|i| i.call_count).sum();

        let invoice = Invoice {
            id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            status: InvoiceStatus::Draft,
            cycle_start,
            cycle_end,
            line_items,
            total_credits,
            total_calls,
            created_at: now,
            finalized_at: None,
            paid_at: None,
            voided_at: None,
        };
        self.invoices
            .write()
            .insert(invoice.id.clone(), invoice.clone());
        info!(invoice = %invoice.id, total_credits, "drafted invoice");
        Ok(invoice)
    }

    pub fn finalize_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        let now = self.clock.now_ms();
        let mut invoices = self.invoices.write();
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| GateError::NotFound(format!("invoice {}", invoice_id)))?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(GateError::InvalidState(format!(
                "cannot finalize invoice in state {:?}",
                invoice.status
            )));
        }
        invoice.status = InvoiceStatus::Finalized;
        invoice.finalized_at = Some(now);
        *self.total_credits_invoiced.write() += invoice.total_credits;
        Ok(invoice.clone())
    }

    pub fn mark_paid(&self, invoice_id: &str) -> Result<Invoice> {
        let now = self.clock.now_ms();
        let mut invoices = self.invoices.write();
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| GateError::NotFound(format!("invoice {}", invoice_id)))?;
        if invoice.status != InvoiceStatus::Finalized {
            return Err(GateError::InvalidState(format!(
                "cannot pay invoice in state {:?}",
                invoice.status
            )));
        }
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(now);
        Ok(invoice.clone())
    }

    pub fn void_invoice(&self, invoice_id: &str) -> Result<Invoice> {
        let now = self.clock.now_ms();
        let mut invoices = self.invoices.write();
        let invoice = invoices
            .get_mut(invoice_id)
            .ok_or_else(|| GateError::NotFound(format!("invoice {}", invoice_id)))?;
        match invoice.status {
            InvoiceStatus::Draft | InvoiceStatus::Finalized => {
                invoice.status = InvoiceStatus::Voided;
                invoice.voided_at = Some(now);
                Ok(invoice.clone())
            }
            status => Err(GateError::InvalidState(format!(
                "cannot void invoice in state {:?}",
                status
            ))),
        }
    }

    pub fn get_invoice(&self, invoice_id: &str) -> Option<Invoice> {
        self.invoices.read().get(invoice_id).cloned()
    }

    pub fn list_invoices(&self, key: Option<&str>) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .read()
            .values()
            .filter(|i| key.map(|k| i.key == k).unwrap_or(true))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        invoices
    }

    pub fn total_credits_invoiced(&self) -> u64 {
        *self.total_credits_invoiced.read()
    }
}

fn to_utc(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

// Calendar arithmetic in UTC: daily = +1 day, weekly = +7 days,
// monthly = +1 calendar month.
fn advance_one(start_ms: u64, frequency: BillingFrequency) -> u64 {
    let start = to_utc(start_ms);
    let end = match frequency {
        BillingFrequency::Daily => start.checked_add_days(Days::new(1)),
        BillingFrequency::Weekly => start.checked_add_days(Days::new(7)),
        BillingFrequency::Monthly => start.checked_add_months(Months::new(1)),
    };
    end.map(|d| d.timestamp_millis() as u64)
        .unwrap_or(start_ms + 86_400_000)
}

fn advance_until_contains(subscription: &mut BillingSubscription, now: u64) {
    while now >= subscription.cycle_end {
        subscription.cycle_start = subscription.cycle_end;
        subscription.cycle_end = advance_one(subscription.cycle_end, subscription.frequency);
    }
}
