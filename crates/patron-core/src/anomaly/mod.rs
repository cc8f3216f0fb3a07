//! Anomaly findings, the active-finding registry, and risk reporting.
//!
//! The detector (see [`detector`]) emits [`AnomalyFinding`]s; they never
//! block anything on their own. A finding becomes an active hard-block
//! trigger only when its factor name is listed in the merchant's
//! block-factor set, at which point the limiter refuses the matching
//! customer/device until an operator clears the finding.
//!
//! Finding lifecycle is owned by the reporting collaborator: the registry
//! exposes `clear_*` and `expire_before` but never expires entries on its
//! own.

pub mod detector;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use detector::{AnomalyDetector, DetectorConfig};

/// Canonical factor names and their heuristic weights.
///
/// Factor names are plain strings end to end so merchant tooling can also
/// register operator-defined factors (e.g. `blacklisted_customer`) without a
/// code change.
pub mod factors {
    /// More than the allowed number of transactions inside a rolling hour.
    pub const RAPID_TRANSACTIONS: &str = "rapid_transactions";
    /// Single transaction above the configured amount threshold.
    pub const LARGE_TRANSACTION: &str = "large_transaction";
    /// Earn immediately followed by a near-equal redeem.
    pub const EARN_REDEEM_PATTERN: &str = "earn_redeem_pattern";
    /// Activity during the merchant-local night window.
    pub const NIGHT_ACTIVITY: &str = "night_activity";
    /// Refunded-receipt fraction above the threshold.
    pub const HIGH_REFUND_RATE: &str = "high_refund_rate";
    /// Earn amount above the per-transaction points cap.
    pub const POINTS_CAP: &str = "points_cap";
    /// Transaction arrived without a device identifier.
    pub const NO_DEVICE_ID: &str = "no_device_id";
    /// Transaction arrived without a staff identifier.
    pub const NO_STAFF_ID: &str = "no_staff_id";
    /// Customer blacklisted by an operator; raised by review tooling.
    pub const BLACKLISTED_CUSTOMER: &str = "blacklisted_customer";
}

/// Strips a legacy `factor:detail` suffix, leaving the bare factor name.
///
/// Older tooling encoded evidence into the factor string
/// (`rapid_transactions:7_in_5min`); block-factor matching compares only the
/// part before the first colon.
#[must_use]
pub fn base_factor(factor: &str) -> &str {
    factor.split(':').next().unwrap_or(factor)
}

/// Who or what a finding is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySubject {
    /// A customer of the merchant.
    Customer {
        /// Customer identifier.
        customer_id: String,
    },
    /// A registered device.
    Device {
        /// Device identifier.
        device_id: String,
    },
    /// An outlet, when no device can be attributed.
    Outlet {
        /// Outlet identifier.
        outlet_id: String,
    },
    /// A device at a specific outlet.
    OutletDevice {
        /// Outlet identifier.
        outlet_id: String,
        /// Device identifier.
        device_id: String,
    },
}

impl AnomalySubject {
    /// Whether the subject matches the customer/device of a transaction.
    ///
    /// Outlet-only subjects never match an admission context: the context
    /// carries no outlet id, so those findings stay review-only.
    #[must_use]
    pub fn matches_context(&self, customer_id: Option<&str>, device_id: Option<&str>) -> bool {
        match self {
            Self::Customer { customer_id: c } => customer_id == Some(c.as_str()),
            Self::Device { device_id: d } | Self::OutletDevice { device_id: d, .. } => {
                device_id == Some(d.as_str())
            },
            Self::Outlet { .. } => false,
        }
    }
}

/// One named risk signal produced by the detector or review tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyFinding {
    /// Unique finding identifier.
    pub id: Uuid,
    /// Merchant the finding belongs to.
    pub merchant_id: String,
    /// Factor name; see [`factors`].
    pub factor: String,
    /// Subject the factor was raised for.
    pub subject: AnomalySubject,
    /// Heuristic weight contributed to the subject's risk score.
    pub weight: u8,
    /// Structured evidence for the review tooling.
    pub evidence: serde_json::Value,
    /// When the detector raised the finding.
    pub detected_at: DateTime<Utc>,
}

impl AnomalyFinding {
    /// Creates a finding with a fresh identifier.
    #[must_use]
    pub fn new(
        merchant_id: impl Into<String>,
        factor: impl Into<String>,
        subject: AnomalySubject,
        weight: u8,
        evidence: serde_json::Value,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            merchant_id: merchant_id.into(),
            factor: factor.into(),
            subject,
            weight,
            evidence,
            detected_at,
        }
    }
}

/// Risk band for a subject, derived from accumulated finding weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Score below 30.
    Low,
    /// Score 30..60.
    Medium,
    /// Score 60..80; flagged for manual review.
    High,
    /// Score 80 and above; recommended for blocking.
    Critical,
}

impl RiskLevel {
    /// Maps a 0..=100 score onto a band.
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::Critical
        } else if score >= 60 {
            Self::High
        } else if score >= 30 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Aggregated risk for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    /// Sum of finding weights, saturated at 100.
    pub score: u8,
    /// Band the score falls into.
    pub level: RiskLevel,
    /// Factors that contributed, in finding order.
    pub factors: Vec<String>,
    /// Whether review tooling should recommend blocking.
    pub should_block: bool,
    /// Whether review tooling should queue the subject for manual review.
    pub should_review: bool,
}

/// Aggregates findings for one subject into a risk score.
#[must_use]
pub fn risk_score<'a>(findings: impl IntoIterator<Item = &'a AnomalyFinding>) -> RiskScore {
    let mut total: u32 = 0;
    let mut contributing = Vec::new();
    for finding in findings {
        total += u32::from(finding.weight);
        contributing.push(finding.factor.clone());
    }
    let score = total.min(100) as u8;
    let level = RiskLevel::from_score(score);
    RiskScore {
        score,
        level,
        factors: contributing,
        should_block: level == RiskLevel::Critical,
        should_review: level == RiskLevel::High,
    }
}

/// Summary counts over a set of findings, for merchant review tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingStats {
    /// Total findings observed.
    pub total: usize,
    /// Findings per base factor name.
    pub by_factor: BTreeMap<String, usize>,
}

impl FindingStats {
    /// Tallies a set of findings.
    #[must_use]
    pub fn collect<'a>(findings: impl IntoIterator<Item = &'a AnomalyFinding>) -> Self {
        let mut stats = Self::default();
        for finding in findings {
            stats.total += 1;
            *stats
                .by_factor
                .entry(base_factor(&finding.factor).to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// The `n` most frequent factors, descending by count.
    #[must_use]
    pub fn top_factors(&self, n: usize) -> Vec<(String, usize)> {
        let mut entries: Vec<(String, usize)> =
            self.by_factor.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }
}

/// Active findings per merchant, consulted by the limiter on every
/// admission.
///
/// Insertions come from [`AnomalyDetector`] sweeps and operator tooling;
/// removal is always explicit (`clear_*`, `expire_before`) because expiry
/// policy belongs to the reporting subsystem, not the hot path.
#[derive(Debug, Default)]
pub struct FindingRegistry {
    inner: RwLock<HashMap<String, Vec<AnomalyFinding>>>,
}

impl FindingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one finding.
    pub fn insert(&self, finding: AnomalyFinding) {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.entry(finding.merchant_id.clone()).or_default().push(finding);
    }

    /// Registers a batch of findings.
    pub fn extend(&self, findings: impl IntoIterator<Item = AnomalyFinding>) {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        for finding in findings {
            inner.entry(finding.merchant_id.clone()).or_default().push(finding);
        }
    }

    /// Findings whose subject matches the given customer/device.
    #[must_use]
    pub fn active_for(
        &self,
        merchant_id: &str,
        customer_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Vec<AnomalyFinding> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .get(merchant_id)
            .map(|findings| {
                findings
                    .iter()
                    .filter(|f| f.subject.matches_context(customer_id, device_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All active findings for a merchant.
    #[must_use]
    pub fn findings_for(&self, merchant_id: &str) -> Vec<AnomalyFinding> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.get(merchant_id).cloned().unwrap_or_default()
    }

    /// Clears every finding with the given base factor; returns how many
    /// were removed.
    pub fn clear_factor(&self, merchant_id: &str, factor: &str) -> usize {
        self.retain(merchant_id, |f| base_factor(&f.factor) != factor)
    }

    /// Clears every finding for the given subject; returns how many were
    /// removed.
    pub fn clear_subject(&self, merchant_id: &str, subject: &AnomalySubject) -> usize {
        self.retain(merchant_id, |f| &f.subject != subject)
    }

    /// Drops findings detected before `cutoff`; returns how many were
    /// removed. Called by the reporting collaborator's TTL job.
    pub fn expire_before(&self, merchant_id: &str, cutoff: DateTime<Utc>) -> usize {
        self.retain(merchant_id, |f| f.detected_at >= cutoff)
    }

    /// Total active findings across all merchants.
    #[must_use]
    pub fn total(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values().map(Vec::len).sum()
    }

    fn retain(&self, merchant_id: &str, keep: impl Fn(&AnomalyFinding) -> bool) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(findings) = inner.get_mut(merchant_id) else {
            return 0;
        };
        let before = findings.len();
        findings.retain(|f| keep(f));
        let removed = before - findings.len();
        if findings.is_empty() {
            inner.remove(merchant_id);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn finding(factor: &str, subject: AnomalySubject, weight: u8) -> AnomalyFinding {
        AnomalyFinding::new("M-1", factor, subject, weight, json!({}), Utc::now())
    }

    fn customer(id: &str) -> AnomalySubject {
        AnomalySubject::Customer { customer_id: id.into() }
    }

    #[test]
    fn test_subject_matching() {
        assert!(customer("C-1").matches_context(Some("C-1"), None));
        assert!(!customer("C-1").matches_context(Some("C-2"), None));
        assert!(!customer("C-1").matches_context(None, None));

        let device = AnomalySubject::Device { device_id: "D-1".into() };
        assert!(device.matches_context(None, Some("D-1")));

        let outlet_device =
            AnomalySubject::OutletDevice { outlet_id: "O-1".into(), device_id: "D-1".into() };
        assert!(outlet_device.matches_context(None, Some("D-1")));

        let outlet = AnomalySubject::Outlet { outlet_id: "O-1".into() };
        assert!(!outlet.matches_context(Some("C-1"), Some("D-1")));
    }

    #[test]
    fn test_base_factor_strips_detail_suffix() {
        assert_eq!(base_factor("rapid_transactions:7_in_5min"), "rapid_transactions");
        assert_eq!(base_factor("blacklisted_customer"), "blacklisted_customer");
    }

    #[test]
    fn test_registry_filters_by_subject() {
        let registry = FindingRegistry::new();
        registry.insert(finding(factors::RAPID_TRANSACTIONS, customer("C-1"), 30));
        registry.insert(finding(
            factors::NIGHT_ACTIVITY,
            AnomalySubject::Device { device_id: "D-1".into() },
            15,
        ));

        let for_c1 = registry.active_for("M-1", Some("C-1"), None);
        assert_eq!(for_c1.len(), 1);
        assert_eq!(for_c1[0].factor, factors::RAPID_TRANSACTIONS);

        let for_d1 = registry.active_for("M-1", None, Some("D-1"));
        assert_eq!(for_d1.len(), 1);
        assert_eq!(for_d1[0].factor, factors::NIGHT_ACTIVITY);

        assert!(registry.active_for("M-2", Some("C-1"), Some("D-1")).is_empty());
    }

    #[test]
    fn test_registry_clear_operations() {
        let registry = FindingRegistry::new();
        registry.insert(finding(factors::RAPID_TRANSACTIONS, customer("C-1"), 30));
        registry.insert(finding(factors::LARGE_TRANSACTION, customer("C-1"), 15));
        registry.insert(finding(factors::RAPID_TRANSACTIONS, customer("C-2"), 30));

        assert_eq!(registry.clear_factor("M-1", factors::RAPID_TRANSACTIONS), 2);
        assert_eq!(registry.total(), 1);

        assert_eq!(registry.clear_subject("M-1", &customer("C-1")), 1);
        assert_eq!(registry.total(), 0);
    }

    #[test]
    fn test_registry_expiry_is_explicit() {
        let registry = FindingRegistry::new();
        let old = AnomalyFinding::new(
            "M-1",
            factors::NIGHT_ACTIVITY,
            customer("C-1"),
            15,
            json!({}),
            Utc::now() - chrono::TimeDelta::days(10),
        );
        registry.insert(old);
        registry.insert(finding(factors::LARGE_TRANSACTION, customer("C-1"), 15));

        // Nothing expires until the collaborator says so.
        assert_eq!(registry.total(), 2);
        let removed = registry.expire_before("M-1", Utc::now() - chrono::TimeDelta::days(7));
        assert_eq!(removed, 1);
        assert_eq!(registry.total(), 1);
    }

    #[test]
    fn test_risk_score_bands() {
        let low = risk_score(std::iter::empty());
        assert_eq!(low.score, 0);
        assert_eq!(low.level, RiskLevel::Low);
        assert!(!low.should_block && !low.should_review);

        let findings = vec![
            finding(factors::RAPID_TRANSACTIONS, customer("C-1"), 30),
            finding(factors::EARN_REDEEM_PATTERN, customer("C-1"), 25),
            finding(factors::LARGE_TRANSACTION, customer("C-1"), 15),
        ];
        let high = risk_score(findings.iter());
        assert_eq!(high.score, 70);
        assert_eq!(high.level, RiskLevel::High);
        assert!(high.should_review && !high.should_block);

        let mut heavy = findings;
        heavy.push(finding(factors::HIGH_REFUND_RATE, customer("C-1"), 20));
        let critical = risk_score(heavy.iter());
        assert_eq!(critical.score, 90);
        assert_eq!(critical.level, RiskLevel::Critical);
        assert!(critical.should_block);
    }

    #[test]
    fn test_risk_score_saturates_at_100() {
        let findings: Vec<_> =
            (0..10).map(|_| finding(factors::RAPID_TRANSACTIONS, customer("C-1"), 30)).collect();
        assert_eq!(risk_score(findings.iter()).score, 100);
    }

    #[test]
    fn test_stats_top_factors() {
        let findings = vec![
            finding(factors::RAPID_TRANSACTIONS, customer("C-1"), 30),
            finding(factors::RAPID_TRANSACTIONS, customer("C-2"), 30),
            finding("large_transaction:amount_12000", customer("C-1"), 15),
        ];
        let stats = FindingStats::collect(findings.iter());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_factor[factors::RAPID_TRANSACTIONS], 2);
        assert_eq!(stats.by_factor[factors::LARGE_TRANSACTION], 1);
        let top = stats.top_factors(1);
        assert_eq!(top, vec![(factors::RAPID_TRANSACTIONS.to_string(), 2)]);
    }
}
