//! Merchant configuration: cashback rules, velocity limits, block factors.
//!
//! Merchants edit this configuration through the admin surfaces; the core
//! treats it as read-only input. The rule list parses from the declared JSON
//! schema:
//!
//! ```json
//! [{ "if":   { "channelIn": ["SMART"], "weekdayIn": [1, 2],
//!              "minEligible": 1000, "categoryIn": ["coffee"] },
//!    "then": { "earnBps": 700, "redeemLimitBps": 5000 } }]
//! ```
//!
//! Documents are validated when configuration is saved
//! ([`RuleSet::parse`] / [`MerchantConfig::validate`]); evaluation never
//! fails at transaction time. Unknown fields and unknown channel names are
//! rejected here rather than tolerated during evaluation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scope::{BASE_RETENTION_DAYS, MAX_RETENTION_DAYS, ScopeType};
use crate::types::{Channel, MAX_BPS, Money};

/// Errors raised while loading or saving merchant configuration.
///
/// These surface to the admin UI at save time; the transaction path only
/// ever sees already-validated snapshots.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The rules document failed to parse against the schema.
    #[error("malformed rules document: {reason}")]
    MalformedRules {
        /// Parser diagnostic.
        reason: String,
    },

    /// A bps rate is outside the representable range.
    #[error("rule #{index}: {field} = {value} is outside 0..=10000 bps")]
    RateOutOfRange {
        /// Zero-based rule index.
        index: usize,
        /// Offending effect field.
        field: &'static str,
        /// Value as parsed.
        value: u16,
    },

    /// A weekday in a condition is not in `0..=6`.
    #[error("rule #{index}: weekday {value} is outside 0..=6")]
    InvalidWeekday {
        /// Zero-based rule index.
        index: usize,
        /// Value as parsed.
        value: u8,
    },

    /// A minimum-eligible amount is negative.
    #[error("rule #{index}: minEligible {value} is negative")]
    NegativeMinEligible {
        /// Zero-based rule index.
        index: usize,
        /// Value as parsed.
        value: Money,
    },

    /// A baseline rate is outside the representable range.
    #[error("baseline {field} = {value} is outside 0..=10000 bps")]
    BaselineOutOfRange {
        /// Offending baseline field.
        field: &'static str,
        /// Value as configured.
        value: u16,
    },

    /// The merchant timezone offset is not a valid fixed offset.
    #[error("utc offset {minutes} minutes is outside -1439..=1439")]
    InvalidUtcOffset {
        /// Offset as configured.
        minutes: i32,
    },

    /// No configuration exists for the merchant.
    #[error("unknown merchant: {merchant_id}")]
    UnknownMerchant {
        /// Merchant that was requested.
        merchant_id: String,
    },
}

/// Condition half of a rule; absent fields are wildcards.
///
/// Present fields AND together. Category matching is a case-sensitive exact
/// comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCondition {
    /// Channels the rule applies to.
    #[serde(rename = "channelIn", default, skip_serializing_if = "Option::is_none")]
    pub channel_in: Option<Vec<Channel>>,

    /// Local weekdays (0 = Sunday .. 6 = Saturday) the rule applies to.
    #[serde(rename = "weekdayIn", default, skip_serializing_if = "Option::is_none")]
    pub weekday_in: Option<Vec<u8>>,

    /// Minimum eligible amount, inclusive.
    #[serde(rename = "minEligible", default, skip_serializing_if = "Option::is_none")]
    pub min_eligible: Option<Money>,

    /// Categories the rule applies to.
    #[serde(rename = "categoryIn", default, skip_serializing_if = "Option::is_none")]
    pub category_in: Option<Vec<String>>,
}

/// Effect half of a rule; absent fields keep the baseline value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEffect {
    /// Earn rate override in basis points.
    #[serde(rename = "earnBps", default, skip_serializing_if = "Option::is_none")]
    pub earn_bps: Option<u16>,

    /// Redemption limit override in basis points.
    #[serde(rename = "redeemLimitBps", default, skip_serializing_if = "Option::is_none")]
    pub redeem_limit_bps: Option<u16>,
}

/// One condition/effect pair. A rule without a condition always matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Match condition; `None` matches everything.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RuleCondition>,

    /// Overrides applied on top of the baseline when the condition holds.
    #[serde(rename = "then")]
    pub effect: RuleEffect,
}

/// Ordered rule list; array order is evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    /// Rules in declaration order.
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Parses and validates a rules document from its JSON text.
    ///
    /// This is the save-time entry point: a document that parses and
    /// validates here cannot fail later during evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedRules`] for schema violations and the
    /// corresponding range error for out-of-range values.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let set: Self = serde_json::from_str(json).map_err(|err| ConfigError::MalformedRules {
            reason: err.to_string(),
        })?;
        set.validate()?;
        Ok(set)
    }

    /// Parses and validates a rules document from an in-memory JSON value.
    ///
    /// # Errors
    ///
    /// Same contract as [`RuleSet::parse`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let set: Self = serde_json::from_value(value).map_err(|err| ConfigError::MalformedRules {
            reason: err.to_string(),
        })?;
        set.validate()?;
        Ok(set)
    }

    /// Validates value ranges the schema cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first range violation found, identified by rule index.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if let Some(bps) = rule.effect.earn_bps {
                if bps > MAX_BPS {
                    return Err(ConfigError::RateOutOfRange { index, field: "earnBps", value: bps });
                }
            }
            if let Some(bps) = rule.effect.redeem_limit_bps {
                if bps > MAX_BPS {
                    return Err(ConfigError::RateOutOfRange {
                        index,
                        field: "redeemLimitBps",
                        value: bps,
                    });
                }
            }
            if let Some(condition) = &rule.condition {
                if let Some(weekdays) = &condition.weekday_in {
                    if let Some(&bad) = weekdays.iter().find(|&&d| d > 6) {
                        return Err(ConfigError::InvalidWeekday { index, value: bad });
                    }
                }
                if let Some(min) = condition.min_eligible {
                    if min < 0 {
                        return Err(ConfigError::NegativeMinEligible { index, value: min });
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Baseline rates used when no rule matches or an effect omits a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBaseline {
    /// Earn rate in basis points.
    #[serde(rename = "earnBps")]
    pub earn_bps: u16,

    /// Redemption limit in basis points.
    #[serde(rename = "redeemLimitBps")]
    pub redeem_limit_bps: u16,
}

impl Default for RateBaseline {
    fn default() -> Self {
        // Platform defaults: 5% earn, up to 50% of a receipt redeemable.
        Self { earn_bps: 500, redeem_limit_bps: 5000 }
    }
}

/// Velocity limits for one scope.
///
/// `monthly_cap` and `points_cap` are only consulted for the customer scope;
/// other scopes leave them at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeLimit {
    /// Maximum events inside the sliding window; 0 disables the check.
    #[serde(default)]
    pub limit: u32,

    /// Sliding window length in seconds; 0 disables the check.
    #[serde(default)]
    pub window_secs: u64,

    /// Events allowed since local midnight; 0 = unlimited.
    #[serde(default)]
    pub daily_cap: u32,

    /// Events allowed since the local week start; 0 = unlimited.
    #[serde(default)]
    pub weekly_cap: u32,

    /// Rolling 30-day soft cap; exceeding it flags but never denies.
    /// 0 = unlimited.
    #[serde(default)]
    pub monthly_cap: u32,

    /// Per-transaction earn amount that raises the `points_cap` factor;
    /// 0 = unlimited.
    #[serde(default)]
    pub points_cap: Money,
}

/// Per-scope limit table for a merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    /// Per-customer limits.
    pub customer: ScopeLimit,
    /// Per-cashier limits.
    pub staff: ScopeLimit,
    /// Per-terminal limits.
    pub device: ScopeLimit,
    /// Whole-merchant limits.
    pub merchant: ScopeLimit,
}

impl Default for ScopeLimits {
    /// Platform defaults applied when a merchant has not overridden a scope.
    fn default() -> Self {
        Self {
            customer: ScopeLimit {
                limit: 5,
                window_secs: 120,
                daily_cap: 5,
                weekly_cap: 0,
                monthly_cap: 40,
                points_cap: 3000,
            },
            staff: ScopeLimit { limit: 60, window_secs: 600, ..ScopeLimit::default() },
            device: ScopeLimit { limit: 20, window_secs: 600, ..ScopeLimit::default() },
            merchant: ScopeLimit { limit: 200, window_secs: 3600, ..ScopeLimit::default() },
        }
    }
}

impl ScopeLimits {
    /// Limits for one scope type.
    #[must_use]
    pub const fn for_scope(&self, scope: ScopeType) -> &ScopeLimit {
        match scope {
            ScopeType::Customer => &self.customer,
            ScopeType::Staff => &self.staff,
            ScopeType::Device => &self.device,
            ScopeType::Merchant => &self.merchant,
        }
    }
}

/// Operator-recorded counter resets.
///
/// A reset timestamp clamps every count's window start: events before the
/// reset never count again, without rewriting the event logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterResets {
    /// Reset for the whole-merchant scope.
    #[serde(default)]
    pub merchant: Option<DateTime<Utc>>,

    /// Per-customer resets.
    #[serde(default)]
    pub customer: HashMap<String, DateTime<Utc>>,

    /// Per-staff resets.
    #[serde(default)]
    pub staff: HashMap<String, DateTime<Utc>>,

    /// Per-device resets.
    #[serde(default)]
    pub device: HashMap<String, DateTime<Utc>>,
}

impl CounterResets {
    /// Reset timestamp applying to one scope id, if any.
    #[must_use]
    pub fn reset_for(&self, scope: ScopeType, scope_id: &str) -> Option<DateTime<Utc>> {
        match scope {
            ScopeType::Merchant => self.merchant,
            ScopeType::Customer => self.customer.get(scope_id).copied(),
            ScopeType::Staff => self.staff.get(scope_id).copied(),
            ScopeType::Device => self.device.get(scope_id).copied(),
        }
    }
}

/// Complete, validated configuration snapshot for one merchant.
///
/// A snapshot is immutable once handed to the admission path; configuration
/// writers publish a fresh snapshot instead of mutating in place, so a single
/// evaluation never observes a partially updated config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantConfig {
    /// Merchant this configuration belongs to.
    pub merchant_id: String,

    /// Baseline rates.
    #[serde(default)]
    pub baseline: RateBaseline,

    /// Ordered cashback rules.
    #[serde(default)]
    pub rules: RuleSet,

    /// Per-scope velocity limits.
    #[serde(default)]
    pub limits: ScopeLimits,

    /// Factor names that force a hard block when raised for the
    /// transaction's subject.
    #[serde(default)]
    pub block_factors: BTreeSet<String>,

    /// Operator counter resets.
    #[serde(default)]
    pub resets: CounterResets,

    /// Merchant timezone as minutes east of UTC; 0 = UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl MerchantConfig {
    /// Creates a configuration with platform defaults for the merchant.
    #[must_use]
    pub fn new(merchant_id: impl Into<String>) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            baseline: RateBaseline::default(),
            rules: RuleSet::default(),
            limits: ScopeLimits::default(),
            block_factors: BTreeSet::new(),
            resets: CounterResets::default(),
            utc_offset_minutes: 0,
        }
    }

    /// Validates the whole snapshot; called when configuration is saved.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rules.validate()?;
        if self.baseline.earn_bps > MAX_BPS {
            return Err(ConfigError::BaselineOutOfRange {
                field: "earnBps",
                value: self.baseline.earn_bps,
            });
        }
        if self.baseline.redeem_limit_bps > MAX_BPS {
            return Err(ConfigError::BaselineOutOfRange {
                field: "redeemLimitBps",
                value: self.baseline.redeem_limit_bps,
            });
        }
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::InvalidUtcOffset { minutes: self.utc_offset_minutes });
        }
        Ok(())
    }

    /// Event retention horizon in days for this merchant.
    ///
    /// The weekly cap needs 7 days; the rolling monthly soft cap, when
    /// enabled, extends the horizon to 30.
    #[must_use]
    pub fn retention_days(&self) -> i64 {
        if self.limits.customer.monthly_cap > 0 {
            MAX_RETENTION_DAYS
        } else {
            BASE_RETENTION_DAYS
        }
    }
}

/// Read access to merchant configuration, implemented by the persistence
/// collaborator.
///
/// A single call returns a consistent snapshot; implementations must never
/// expose a partially updated configuration.
pub trait ConfigSource: Send + Sync {
    /// Returns the current snapshot for a merchant.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownMerchant`] when no configuration exists.
    fn merchant_config(&self, merchant_id: &str) -> Result<Arc<MerchantConfig>, ConfigError>;
}

/// In-memory configuration source for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    inner: RwLock<HashMap<String, Arc<MerchantConfig>>>,
}

impl MemoryConfigSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and publishes a snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Rejects invalid configuration, mirroring the save-time validation of
    /// the real persistence layer.
    pub fn upsert(&self, config: MerchantConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.insert(config.merchant_id.clone(), Arc::new(config));
        Ok(())
    }
}

impl ConfigSource for MemoryConfigSource {
    fn merchant_config(&self, merchant_id: &str) -> Result<Arc<MerchantConfig>, ConfigError> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner
            .get(merchant_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownMerchant { merchant_id: merchant_id.to_string() })
    }
}
