// Billing
//
// Credit accounting around the key store: duration billing for long-lived
// connections, rolling billing cycles with invoice generation, atomic
// balance transfers with reversal, and all-or-nothing credit batches.

pub mod batch;
pub mod connection;
pub mod cycle;
pub mod transfer;

pub use batch::{BatchCreditManager, BatchConfig, BatchExecutionResult, BatchOp, BatchOpKind, BatchOpResult};
pub use connection::{
    ConnectionBillResult, ConnectionBillingConfig, ConnectionBillingManager, ConnectionSession,
};
pub use cycle::{
    BillingCycleConfig, BillingCycleManager, BillingFrequency, BillingSubscription, Invoice,
    InvoiceLineItem, InvoiceStatus, UsageRecord,
};
pub use transfer::{CreditTransferManager, TransferConfig, TransferRecord};
