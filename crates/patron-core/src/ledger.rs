//! Read contract against the transaction/receipt ledger.
//!
//! The ledger is owned by the persistence collaborator; the core only needs
//! a sampling window for the anomaly detector. Velocity counters do not go
//! through this trait — they live in the in-process scope event store.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Money, TransactionKind};

/// Errors from the ledger collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LedgerError {
    /// The ledger backend could not serve the request.
    #[error("ledger unavailable: {message}")]
    Unavailable {
        /// Backend diagnostic.
        message: String,
    },
}

/// One committed loyalty transaction as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    /// Ledger identifier.
    pub id: String,
    /// Owning merchant.
    pub merchant_id: String,
    /// Customer the operation was attributed to, if any.
    pub customer_id: Option<String>,
    /// Outlet the operation happened at, if known.
    pub outlet_id: Option<String>,
    /// Device that performed the operation, if known.
    pub device_id: Option<String>,
    /// Cashier that performed the operation, if known.
    pub staff_id: Option<String>,
    /// Earn, redeem or refund.
    pub kind: TransactionKind,
    /// Amount in minor units; sign follows the ledger convention
    /// (redemptions are stored negative).
    pub amount: Money,
    /// Commit time.
    pub occurred_at: DateTime<Utc>,
}

/// One receipt as read back from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    /// Ledger identifier.
    pub id: String,
    /// Owning merchant.
    pub merchant_id: String,
    /// Outlet the receipt was issued at, if known.
    pub outlet_id: Option<String>,
    /// Device that issued the receipt, if known.
    pub device_id: Option<String>,
    /// Receipt total in minor units.
    pub total: Money,
    /// Whether the receipt has been refunded.
    pub refunded: bool,
    /// Issue time.
    pub created_at: DateTime<Utc>,
}

/// Read access to the ledger, implemented by the persistence collaborator.
pub trait LedgerReader: Send + Sync {
    /// Transactions for a merchant inside `[from, to]`, ordered by time.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] when the backend cannot serve the read.
    fn list_transactions(
        &self,
        merchant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError>;

    /// Most recent receipts for a merchant, newest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Unavailable`] when the backend cannot serve the read.
    fn list_receipts(
        &self,
        merchant_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerReceipt>, LedgerError>;
}

/// In-memory ledger for tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    transactions: RwLock<Vec<LedgerTransaction>>,
    receipts: RwLock<Vec<LedgerReceipt>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transaction.
    pub fn push_transaction(&self, transaction: LedgerTransaction) {
        self.transactions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(transaction);
    }

    /// Appends a receipt.
    pub fn push_receipt(&self, receipt: LedgerReceipt) {
        self.receipts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(receipt);
    }
}

impl LedgerReader for MemoryLedger {
    fn list_transactions(
        &self,
        merchant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        let transactions = self
            .transactions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out: Vec<LedgerTransaction> = transactions
            .iter()
            .filter(|t| t.merchant_id == merchant_id && t.occurred_at >= from && t.occurred_at <= to)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.occurred_at);
        Ok(out)
    }

    fn list_receipts(
        &self,
        merchant_id: &str,
        limit: usize,
    ) -> Result<Vec<LedgerReceipt>, LedgerError> {
        let receipts = self
            .receipts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out: Vec<LedgerReceipt> = receipts
            .iter()
            .filter(|r| r.merchant_id == merchant_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn tx(id: &str, at: DateTime<Utc>) -> LedgerTransaction {
        LedgerTransaction {
            id: id.into(),
            merchant_id: "M-1".into(),
            customer_id: Some("C-1".into()),
            outlet_id: None,
            device_id: None,
            staff_id: None,
            kind: TransactionKind::Earn,
            amount: 100,
            occurred_at: at,
        }
    }

    #[test]
    fn test_transactions_filtered_by_window_and_sorted() {
        let ledger = MemoryLedger::new();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        ledger.push_transaction(tx("t2", base + chrono::TimeDelta::seconds(10)));
        ledger.push_transaction(tx("t1", base));
        ledger.push_transaction(tx("t3", base + chrono::TimeDelta::days(2)));

        let window = ledger
            .list_transactions("M-1", base, base + chrono::TimeDelta::days(1))
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].id, "t1");
        assert_eq!(window[1].id, "t2");
    }

    #[test]
    fn test_receipts_newest_first_with_limit() {
        let ledger = MemoryLedger::new();
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        for i in 0..5 {
            ledger.push_receipt(LedgerReceipt {
                id: format!("r{i}"),
                merchant_id: "M-1".into(),
                outlet_id: None,
                device_id: None,
                total: 100,
                refunded: false,
                created_at: base + chrono::TimeDelta::seconds(i),
            });
        }
        let recent = ledger.list_receipts("M-1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "r4");
        assert_eq!(recent[1].id, "r3");
    }
}
