//! Batch heuristics over a recent ledger window.
//!
//! The detector runs off the hot admission path, periodically or on demand,
//! over a transaction/receipt sample supplied by the ledger collaborator. It
//! only produces findings; blocking is the limiter's job and only happens
//! for factors the merchant has explicitly listed.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;

use super::{AnomalyFinding, AnomalySubject, factors};
use crate::clock::local_hour;
use crate::ledger::{LedgerReceipt, LedgerTransaction};
use crate::types::{Money, TransactionKind};

// Heuristic weights feeding the subject risk score.
const WEIGHT_RAPID_TRANSACTIONS: u8 = 30;
const WEIGHT_LARGE_TRANSACTION: u8 = 15;
const WEIGHT_EARN_REDEEM_PATTERN: u8 = 25;
const WEIGHT_NIGHT_ACTIVITY: u8 = 15;
const WEIGHT_HIGH_REFUND_RATE: u8 = 20;

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Rolling sub-window for the rapid-transaction check, in seconds.
    pub rapid_window_secs: u64,

    /// Transactions allowed inside the rolling window; more than this flags.
    pub rapid_max_transactions: usize,

    /// Absolute amount above which a single transaction flags, in minor
    /// units.
    pub large_transaction_threshold: Money,

    /// Redeem-to-earn ratio at or above which an adjacent earn/redeem pair
    /// flags.
    pub earn_redeem_ratio: f64,

    /// First merchant-local hour of the night window, inclusive.
    pub night_start_hour: u32,

    /// Last merchant-local hour of the night window, exclusive.
    pub night_end_hour: u32,

    /// Refunded-receipt fraction above which an (outlet, device) flags.
    pub refund_rate_threshold: f64,

    /// Receipts sampled per sweep for the refund-rate check.
    pub receipt_sample_limit: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rapid_window_secs: 3600,
            rapid_max_transactions: 5,
            large_transaction_threshold: 10_000,
            earn_redeem_ratio: 0.9,
            night_start_hour: 0,
            night_end_hour: 6,
            refund_rate_threshold: 0.10,
            receipt_sample_limit: 500,
        }
    }
}

/// Runs the heuristics over one merchant's ledger sample.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    /// Creates a detector with the given thresholds.
    #[must_use]
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Thresholds in effect.
    #[must_use]
    pub const fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Runs every heuristic and returns the combined findings.
    ///
    /// `transactions` is the sampling window from the ledger;
    /// `utc_offset_minutes` is the merchant timezone used for the night
    /// check.
    #[must_use]
    pub fn scan(
        &self,
        merchant_id: &str,
        transactions: &[LedgerTransaction],
        receipts: &[LedgerReceipt],
        utc_offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let by_customer = group_by_customer(transactions);

        let mut findings = Vec::new();
        findings.extend(self.detect_rapid_transactions(merchant_id, &by_customer, now));
        findings.extend(self.detect_large_transactions(merchant_id, transactions, now));
        findings.extend(self.detect_earn_redeem_patterns(merchant_id, &by_customer, now));
        findings.extend(self.detect_night_activity(
            merchant_id,
            transactions,
            utc_offset_minutes,
            now,
        ));
        findings.extend(self.detect_high_refund_rate(merchant_id, receipts, now));

        for finding in &findings {
            tracing::debug!(
                merchant_id,
                factor = %finding.factor,
                subject = ?finding.subject,
                "anomaly finding raised"
            );
        }
        findings
    }

    /// Flags customers with more than the allowed number of transactions in
    /// any rolling sub-window.
    fn detect_rapid_transactions(
        &self,
        merchant_id: &str,
        by_customer: &BTreeMap<&str, Vec<&LedgerTransaction>>,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let window = TimeDelta::seconds(self.config.rapid_window_secs as i64);
        let mut findings = Vec::new();
        for (customer_id, txs) in by_customer {
            let mut peak = 0usize;
            let mut peak_start = None;
            let mut left = 0usize;
            for right in 0..txs.len() {
                while txs[right].occurred_at - txs[left].occurred_at > window {
                    left += 1;
                }
                let count = right - left + 1;
                if count > peak {
                    peak = count;
                    peak_start = Some(txs[left].occurred_at);
                }
            }
            if peak > self.config.rapid_max_transactions {
                findings.push(AnomalyFinding::new(
                    merchant_id,
                    factors::RAPID_TRANSACTIONS,
                    AnomalySubject::Customer { customer_id: (*customer_id).to_string() },
                    WEIGHT_RAPID_TRANSACTIONS,
                    json!({
                        "count": peak,
                        "window_secs": self.config.rapid_window_secs,
                        "window_start": peak_start,
                    }),
                    now,
                ));
            }
        }
        findings
    }

    /// Flags individual transactions above the amount threshold.
    fn detect_large_transactions(
        &self,
        merchant_id: &str,
        transactions: &[LedgerTransaction],
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let mut findings = Vec::new();
        for tx in transactions {
            if tx.amount.abs() <= self.config.large_transaction_threshold {
                continue;
            }
            let Some(subject) = transaction_subject(tx) else {
                continue;
            };
            findings.push(AnomalyFinding::new(
                merchant_id,
                factors::LARGE_TRANSACTION,
                subject,
                WEIGHT_LARGE_TRANSACTION,
                json!({
                    "transaction_id": tx.id,
                    "amount": tx.amount,
                    "threshold": self.config.large_transaction_threshold,
                }),
                now,
            ));
        }
        findings
    }

    /// Flags an earn immediately followed by a near-equal redeem for the
    /// same customer.
    fn detect_earn_redeem_patterns(
        &self,
        merchant_id: &str,
        by_customer: &BTreeMap<&str, Vec<&LedgerTransaction>>,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let mut findings = Vec::new();
        for (customer_id, txs) in by_customer {
            for pair in txs.windows(2) {
                let (earn, redeem) = (pair[0], pair[1]);
                if earn.kind != TransactionKind::Earn || redeem.kind != TransactionKind::Redeem {
                    continue;
                }
                if earn.amount <= 0 {
                    continue;
                }
                let ratio = redeem.amount.abs() as f64 / earn.amount as f64;
                if ratio >= self.config.earn_redeem_ratio {
                    findings.push(AnomalyFinding::new(
                        merchant_id,
                        factors::EARN_REDEEM_PATTERN,
                        AnomalySubject::Customer { customer_id: (*customer_id).to_string() },
                        WEIGHT_EARN_REDEEM_PATTERN,
                        json!({
                            "earn_transaction_id": earn.id,
                            "redeem_transaction_id": redeem.id,
                            "earn_amount": earn.amount,
                            "redeem_amount": redeem.amount,
                        }),
                        now,
                    ));
                }
            }
        }
        findings
    }

    /// Aggregates merchant-local night-window activity per (outlet, device).
    fn detect_night_activity(
        &self,
        merchant_id: &str,
        transactions: &[LedgerTransaction],
        utc_offset_minutes: i32,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let mut counts: BTreeMap<(Option<&str>, Option<&str>), usize> = BTreeMap::new();
        for tx in transactions {
            let hour = local_hour(tx.occurred_at, utc_offset_minutes);
            if hour < self.config.night_start_hour || hour >= self.config.night_end_hour {
                continue;
            }
            if tx.outlet_id.is_none() && tx.device_id.is_none() {
                // Nothing to attribute the activity to.
                continue;
            }
            *counts.entry((tx.outlet_id.as_deref(), tx.device_id.as_deref())).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter_map(|((outlet_id, device_id), count)| {
                let subject = place_subject(outlet_id, device_id)?;
                Some(AnomalyFinding::new(
                    merchant_id,
                    factors::NIGHT_ACTIVITY,
                    subject,
                    WEIGHT_NIGHT_ACTIVITY,
                    json!({
                        "count": count,
                        "night_hours": [self.config.night_start_hour, self.config.night_end_hour],
                    }),
                    now,
                ))
            })
            .collect()
    }

    /// Flags (outlet, device) pairs whose refunded-receipt fraction exceeds
    /// the threshold.
    fn detect_high_refund_rate(
        &self,
        merchant_id: &str,
        receipts: &[LedgerReceipt],
        now: DateTime<Utc>,
    ) -> Vec<AnomalyFinding> {
        let mut totals: BTreeMap<(Option<&str>, Option<&str>), (usize, usize)> = BTreeMap::new();
        for receipt in receipts {
            if receipt.outlet_id.is_none() && receipt.device_id.is_none() {
                continue;
            }
            let entry = totals
                .entry((receipt.outlet_id.as_deref(), receipt.device_id.as_deref()))
                .or_insert((0, 0));
            entry.0 += 1;
            if receipt.refunded {
                entry.1 += 1;
            }
        }
        totals
            .into_iter()
            .filter_map(|((outlet_id, device_id), (total, refunded))| {
                if total == 0 {
                    return None;
                }
                let rate = refunded as f64 / total as f64;
                if rate <= self.config.refund_rate_threshold {
                    return None;
                }
                let subject = place_subject(outlet_id, device_id)?;
                Some(AnomalyFinding::new(
                    merchant_id,
                    factors::HIGH_REFUND_RATE,
                    subject,
                    WEIGHT_HIGH_REFUND_RATE,
                    json!({ "refunded": refunded, "total": total, "rate": rate }),
                    now,
                ))
            })
            .collect()
    }
}

/// Groups a ledger sample per customer, each group sorted by time.
fn group_by_customer(
    transactions: &[LedgerTransaction],
) -> BTreeMap<&str, Vec<&LedgerTransaction>> {
    let mut by_customer: BTreeMap<&str, Vec<&LedgerTransaction>> = BTreeMap::new();
    for tx in transactions {
        if let Some(customer_id) = tx.customer_id.as_deref() {
            by_customer.entry(customer_id).or_default().push(tx);
        }
    }
    for txs in by_customer.values_mut() {
        txs.sort_by_key(|t| t.occurred_at);
    }
    by_customer
}

/// Attributes a single transaction to its most specific subject.
fn transaction_subject(tx: &LedgerTransaction) -> Option<AnomalySubject> {
    if let Some(customer_id) = &tx.customer_id {
        return Some(AnomalySubject::Customer { customer_id: customer_id.clone() });
    }
    place_subject(tx.outlet_id.as_deref(), tx.device_id.as_deref())
}

/// Builds an outlet/device subject from whichever ids are known.
fn place_subject(outlet_id: Option<&str>, device_id: Option<&str>) -> Option<AnomalySubject> {
    match (outlet_id, device_id) {
        (Some(outlet), Some(device)) => Some(AnomalySubject::OutletDevice {
            outlet_id: outlet.to_string(),
            device_id: device.to_string(),
        }),
        (None, Some(device)) => Some(AnomalySubject::Device { device_id: device.to_string() }),
        (Some(outlet), None) => Some(AnomalySubject::Outlet { outlet_id: outlet.to_string() }),
        (None, None) => None,
    }
}
