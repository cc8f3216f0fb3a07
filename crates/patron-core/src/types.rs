//! Core domain primitives shared across the admission path.
//!
//! Everything here is plain data: the transaction context is built once per
//! request and never mutated afterwards, so the rule engine, the limiter and
//! the detector all observe the same values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monetary amount in minor units (e.g. kopecks, cents).
pub type Money = i64;

/// Upper bound for basis-point rates: 10000 bps = 100%.
pub const MAX_BPS: u16 = 10_000;

/// Sales channel a transaction arrives through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Virtual terminal (mini-app / online checkout).
    Virtual,
    /// Classic PC point-of-sale.
    PcPos,
    /// Smart POS terminal.
    Smart,
}

impl Channel {
    /// Returns the wire representation used by the rule schema.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Virtual => "VIRTUAL",
            Self::PcPos => "PC_POS",
            Self::Smart => "SMART",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a loyalty operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Points accrual against a purchase.
    Earn,
    /// Points redemption against a purchase.
    Redeem,
    /// Reversal of a previously committed receipt.
    Refund,
}

impl TransactionKind {
    /// Returns the wire representation used by the ledger.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "EARN",
            Self::Redeem => "REDEEM",
            Self::Refund => "REFUND",
        }
    }
}

/// Immutable per-request context, constructed once at the admission boundary.
///
/// `weekday` is carried explicitly (0 = Sunday .. 6 = Saturday) rather than
/// derived from `occurred_at`, because the rule preview surface evaluates
/// hypothetical weekday/channel combinations that have no real timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    /// Owning merchant.
    pub merchant_id: String,
    /// Earn, redeem or refund.
    pub kind: TransactionKind,
    /// Channel the request arrived through.
    pub channel: Channel,
    /// Local weekday, 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    /// Amount the cashback/redemption rates apply to, in minor units.
    pub eligible_total: Money,
    /// Optional product category for category-scoped rules.
    pub category: Option<String>,
    /// Customer identifier, when the operation is attributed to a customer.
    pub customer_id: Option<String>,
    /// Staff identifier, when a cashier performed the operation.
    pub staff_id: Option<String>,
    /// Device identifier, when a registered terminal performed the operation.
    pub device_id: Option<String>,
    /// Wall-clock time the request was received.
    pub occurred_at: DateTime<Utc>,
}

impl TransactionContext {
    /// Projects the fields the rule engine reads.
    ///
    /// The live admission path and the admin preview both resolve rates
    /// through this projection, so the two paths cannot drift.
    #[must_use]
    pub fn rate_query(&self) -> RateQuery {
        RateQuery {
            channel: self.channel,
            weekday: self.weekday,
            eligible_total: self.eligible_total,
            category: self.category.clone(),
        }
    }
}

/// The subset of a transaction the rule engine conditions on.
///
/// Also the payload of the preview endpoint: merchants dry-run scenarios by
/// submitting a bare query with no transaction behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateQuery {
    /// Channel under test.
    pub channel: Channel,
    /// Local weekday, 0 = Sunday .. 6 = Saturday.
    pub weekday: u8,
    /// Eligible amount in minor units.
    pub eligible_total: Money,
    /// Optional category.
    #[serde(default)]
    pub category: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_names() {
        assert_eq!(Channel::Virtual.as_str(), "VIRTUAL");
        assert_eq!(Channel::PcPos.as_str(), "PC_POS");
        assert_eq!(Channel::Smart.as_str(), "SMART");
        let parsed: Channel = serde_json::from_str("\"PC_POS\"").unwrap();
        assert_eq!(parsed, Channel::PcPos);
    }

    #[test]
    fn test_rate_query_projection() {
        let ctx = TransactionContext {
            merchant_id: "M-1".into(),
            kind: TransactionKind::Earn,
            channel: Channel::Smart,
            weekday: 2,
            eligible_total: 1000,
            category: Some("coffee".into()),
            customer_id: Some("C-1".into()),
            staff_id: None,
            device_id: None,
            occurred_at: Utc::now(),
        };
        let query = ctx.rate_query();
        assert_eq!(query.channel, Channel::Smart);
        assert_eq!(query.weekday, 2);
        assert_eq!(query.eligible_total, 1000);
        assert_eq!(query.category.as_deref(), Some("coffee"));
    }
}
