//! Velocity/caps limiter: the admission gate on the transaction hot path.
//!
//! For every earn/redeem/refund attempt the limiter:
//!
//! 1. Checks active block factors for the transaction's customer/device and
//!    hard-blocks immediately on a match, bypassing velocity entirely — a
//!    hard block is stronger than a rate limit and does not heal by waiting
//!    out a window.
//! 2. Walks the applicable scopes in the fixed order customer, staff,
//!    device, merchant, enforcing the sliding-window limit and the
//!    daily/weekly caps per scope. The first breach decides; explain mode
//!    evaluates everything for diagnostics.
//! 3. Appends a scope event for every applicable scope regardless of the
//!    outcome. Denied attempts count too, so a client hammering retries
//!    never resets its own clock.
//!
//! Each scope key is locked independently and one at a time; a lock wait
//! that exceeds the bound degrades the decision to `SOFT_FLAG` (manual
//! review) instead of blocking a checkout lane or silently admitting.
//!
//! Decisions are values, never errors: every caller must handle all
//! outcomes explicitly.


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::anomaly::{FindingRegistry, base_factor, factors};
use crate::clock::{Clock, local_day_start, local_week_start};
use crate::config::{MerchantConfig, ScopeLimit};
use crate::scope::{SCOPE_CHECK_ORDER, ScopeEventStore, ScopeKey, ScopeLog, ScopeType};
use crate::types::{TransactionContext, TransactionKind};

/// Name of the rolling monthly soft-cap signal.
pub const CUSTOMER_MONTHLY_SIGNAL: &str = "customer_monthly";

/// Final admission state of a transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionVerdict {
    /// Admitted.
    Allow,
    /// Not admitted, but retryable or pending review; self-heals.
    SoftFlag,
    /// Not admitted; requires operator action to clear.
    HardBlock,
}

impl AdmissionVerdict {
    /// Stable lowercase name for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::SoftFlag => "soft_flag",
            Self::HardBlock => "hard_block",
        }
    }
}

/// Why the verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    /// No limit stood in the way.
    Admitted,
    /// Sliding-window limit reached; retryable once the window slides.
    RateLimit,
    /// Daily cap reached; retryable after local midnight.
    DailyCap,
    /// Weekly cap reached; retryable after the local week rolls over.
    WeeklyCap,
    /// An active block factor matched the transaction's subject.
    BlockFactor,
    /// Internal lock/store unavailability; failed safe toward review.
    LockTimeout,
}

impl DecisionReason {
    /// Stable lowercase name for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::RateLimit => "rate_limit",
            Self::DailyCap => "daily_cap",
            Self::WeeklyCap => "weekly_cap",
            Self::BlockFactor => "block_factor",
            Self::LockTimeout => "lock_timeout",
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionDecision {
    /// Final state.
    pub verdict: AdmissionVerdict,
    /// Why.
    pub reason: DecisionReason,
    /// Scope whose limit was breached, for retryable denials.
    pub triggered_scope: Option<ScopeType>,
    /// Factor that forced a hard block. Internal only: end-user surfaces
    /// must not echo it (see [`AdmissionDecision::public_message`]).
    pub triggered_factor: Option<String>,
    /// Hint for retryable denials: how long until the breached limit can
    /// admit again.
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    /// An admitted attempt.
    #[must_use]
    pub const fn allowed() -> Self {
        Self {
            verdict: AdmissionVerdict::Allow,
            reason: DecisionReason::Admitted,
            triggered_scope: None,
            triggered_factor: None,
            retry_after: None,
        }
    }

    /// A hard block on the given factor.
    #[must_use]
    pub fn hard_block(factor: String) -> Self {
        Self {
            verdict: AdmissionVerdict::HardBlock,
            reason: DecisionReason::BlockFactor,
            triggered_scope: None,
            triggered_factor: Some(factor),
            retry_after: None,
        }
    }

    /// The fail-safe outcome for internal lock/store trouble.
    #[must_use]
    pub const fn lock_timeout() -> Self {
        Self {
            verdict: AdmissionVerdict::SoftFlag,
            reason: DecisionReason::LockTimeout,
            triggered_scope: None,
            triggered_factor: None,
            retry_after: None,
        }
    }

    fn from_breach(breach: &ScopeBreach) -> Self {
        Self {
            verdict: AdmissionVerdict::SoftFlag,
            reason: breach.reason,
            triggered_scope: Some(breach.scope),
            triggered_factor: None,
            retry_after: breach.retry_after,
        }
    }

    /// Whether the transaction may proceed.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        self.verdict == AdmissionVerdict::Allow
    }

    /// End-user-safe description of the outcome.
    ///
    /// Retryable denials carry the retry hint; hard blocks deliberately do
    /// not say which factor triggered, so a probing attacker learns nothing
    /// about the rule set.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.verdict {
            AdmissionVerdict::Allow => "OK".to_string(),
            AdmissionVerdict::HardBlock => {
                "Operation blocked, please contact support".to_string()
            },
            AdmissionVerdict::SoftFlag => match self.retry_after {
                Some(wait) => {
                    format!("Operation limit reached, retry in {}s", wait.as_secs().max(1))
                },
                None => "Operation is pending review".to_string(),
            },
        }
    }
}

/// One breached limit, as reported by explain mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeBreach {
    /// Scope whose limit was breached.
    pub scope: ScopeType,
    /// Which limit.
    pub reason: DecisionReason,
    /// Events counted in the limit's window.
    pub count: u64,
    /// Configured limit.
    pub limit: u64,
    /// How long until this limit can admit again.
    pub retry_after: Option<Duration>,
}

/// A non-blocking risk signal raised while evaluating the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftSignal {
    /// Factor or signal name.
    pub factor: String,
    /// Structured detail.
    pub evidence: serde_json::Value,
}

/// Full diagnostics for one attempt; `admit` returns only the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionExplanation {
    /// The decision the short-circuit path would have returned.
    pub decision: AdmissionDecision,
    /// Every breached limit (one entry in short-circuit mode).
    pub breaches: Vec<ScopeBreach>,
    /// Non-blocking signals raised along the way.
    pub soft_signals: Vec<SoftSignal>,
}

/// The stateful admission gate.
pub struct VelocityLimiter {
    store: Arc<ScopeEventStore>,
    clock: Arc<dyn Clock>,
}

impl VelocityLimiter {
    /// Creates a limiter over the given store and clock.
    #[must_use]
    pub fn new(store: Arc<ScopeEventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The scope event store backing this limiter.
    #[must_use]
    pub fn store(&self) -> &Arc<ScopeEventStore> {
        &self.store
    }

    /// Decides one transaction attempt, short-circuiting on the first
    /// breach.
    ///
    /// A scope event is recorded for every applicable scope whatever the
    /// outcome, and recording completes before this method returns — an
    /// abandoning caller cannot keep its velocity counters clean.
    #[must_use]
    pub fn admit(
        &self,
        ctx: &TransactionContext,
        config: &MerchantConfig,
        registry: &FindingRegistry,
    ) -> AdmissionDecision {
        self.evaluate(ctx, config, registry, false).decision
    }

    /// Decides one attempt while evaluating every scope and limit, for
    /// diagnostic callers.
    #[must_use]
    pub fn admit_explained(
        &self,
        ctx: &TransactionContext,
        config: &MerchantConfig,
        registry: &FindingRegistry,
    ) -> AdmissionExplanation {
        self.evaluate(ctx, config, registry, true)
    }

    fn evaluate(
        &self,
        ctx: &TransactionContext,
        config: &MerchantConfig,
        registry: &FindingRegistry,
        explain: bool,
    ) -> AdmissionExplanation {
        let now = self.clock.now();
        let retention_cutoff = now - TimeDelta::days(config.retention_days());

        // Active block factors beat everything else; velocity is not
        // consulted for a blocked subject.
        let mut hard_factor: Option<String> = None;
        if !config.block_factors.is_empty() {
            let active = registry.active_for(
                &ctx.merchant_id,
                ctx.customer_id.as_deref(),
                ctx.device_id.as_deref(),
            );
            for finding in &active {
                let factor = base_factor(&finding.factor);
                if config.block_factors.contains(factor) {
                    hard_factor = Some(factor.to_string());
                    break;
                }
            }
        }

        let mut soft_signals = Vec::new();
        for signal in context_signals(ctx, config) {
            if hard_factor.is_none() && config.block_factors.contains(&signal.factor) {
                hard_factor = Some(signal.factor.clone());
            } else {
                tracing::warn!(
                    merchant_id = %ctx.merchant_id,
                    factor = %signal.factor,
                    "soft risk signal raised"
                );
            }
            soft_signals.push(signal);
        }

        let mut breaches: Vec<ScopeBreach> = Vec::new();
        let mut degraded = false;
        for scope in SCOPE_CHECK_ORDER {
            let Some(scope_id) = scope_id_for(ctx, scope) else {
                continue;
            };
            let key = ScopeKey::new(ctx.merchant_id.clone(), scope, scope_id);
            let limit = *config.limits.for_scope(scope);
            let reset = config.resets.reset_for(scope, scope_id);
            let offset_minutes = config.utc_offset_minutes;
            let skip_checks = hard_factor.is_some() || (!explain && !breaches.is_empty());

            let outcome = self.store.with_log(&key, now, |log| {
                log.evict_older_than(retention_cutoff);
                let mut found = Vec::new();
                let mut signal = None;
                if !skip_checks {
                    found = run_scope_checks(log, scope, &limit, reset, offset_minutes, now, explain);
                    if scope == ScopeType::Customer {
                        signal = monthly_soft_cap_signal(log, &limit, reset, now);
                    }
                }
                // Recorded whatever the outcome: denials count too.
                log.append(now);
                (found, signal)
            });

            match outcome {
                Ok((found, signal)) => {
                    for breach in &found {
                        tracing::warn!(
                            merchant_id = %ctx.merchant_id,
                            scope = %breach.scope,
                            reason = breach.reason.as_str(),
                            count = breach.count,
                            limit = breach.limit,
                            "velocity limit breached"
                        );
                    }
                    breaches.extend(found);
                    soft_signals.extend(signal);
                },
                Err(err) => {
                    tracing::warn!(
                        merchant_id = %ctx.merchant_id,
                        scope = %scope,
                        error = %err,
                        "scope store degraded, failing safe toward review"
                    );
                    degraded = true;
                },
            }
        }

        let decision = if let Some(factor) = hard_factor {
            tracing::warn!(
                merchant_id = %ctx.merchant_id,
                factor = %factor,
                "transaction hard-blocked by factor"
            );
            AdmissionDecision::hard_block(factor)
        } else if let Some(breach) = breaches.first() {
            AdmissionDecision::from_breach(breach)
        } else if degraded {
            AdmissionDecision::lock_timeout()
        } else {
            AdmissionDecision::allowed()
        };

        AdmissionExplanation { decision, breaches, soft_signals }
    }
}

impl std::fmt::Debug for VelocityLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VelocityLimiter").field("store", &self.store).finish_non_exhaustive()
    }
}

/// Scope id from the context, when the scope applies to this transaction.
fn scope_id_for<'a>(ctx: &'a TransactionContext, scope: ScopeType) -> Option<&'a str> {
    match scope {
        ScopeType::Customer => ctx.customer_id.as_deref(),
        ScopeType::Staff => ctx.staff_id.as_deref(),
        ScopeType::Device => ctx.device_id.as_deref(),
        ScopeType::Merchant => Some(ctx.merchant_id.as_str()),
    }
}

/// Synchronous factors derived from the context itself.
///
/// Presence factors are only evaluated when the merchant has opted into
/// them; the points cap always raises its signal so review tooling sees it
/// even when it does not block.
fn context_signals(ctx: &TransactionContext, config: &MerchantConfig) -> Vec<SoftSignal> {
    let mut signals = Vec::new();
    let points_cap = config.limits.customer.points_cap;
    if ctx.kind == TransactionKind::Earn && points_cap > 0 && ctx.eligible_total > points_cap {
        signals.push(SoftSignal {
            factor: factors::POINTS_CAP.to_string(),
            evidence: json!({ "amount": ctx.eligible_total, "cap": points_cap }),
        });
    }
    if ctx.device_id.is_none() && config.block_factors.contains(factors::NO_DEVICE_ID) {
        signals.push(SoftSignal {
            factor: factors::NO_DEVICE_ID.to_string(),
            evidence: json!({}),
        });
    }
    if ctx.staff_id.is_none() && config.block_factors.contains(factors::NO_STAFF_ID) {
        signals.push(SoftSignal {
            factor: factors::NO_STAFF_ID.to_string(),
            evidence: json!({}),
        });
    }
    signals
}

/// Clamps a window start by the scope's reset timestamp, if any.
fn clamp_start(start: DateTime<Utc>, reset: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match reset {
        Some(reset_at) if reset_at > start => reset_at,
        _ => start,
    }
}

/// Evaluates the sliding-window limit and the daily/weekly caps for one
/// scope. Short-circuits on the first breach unless `explain` is set.
fn run_scope_checks(
    log: &ScopeLog,
    scope: ScopeType,
    limit: &ScopeLimit,
    reset: Option<DateTime<Utc>>,
    offset_minutes: i32,
    now: DateTime<Utc>,
    explain: bool,
) -> Vec<ScopeBreach> {
    let mut breaches = Vec::new();

    if limit.limit > 0 && limit.window_secs > 0 {
        let window = TimeDelta::seconds(limit.window_secs as i64);
        let from = clamp_start(now - window, reset);
        let count = log.count_window(from, now);
        if count >= u64::from(limit.limit) {
            let retry_after = log
                .oldest_in_window(from, now)
                .and_then(|oldest| (oldest + window - now).to_std().ok());
            breaches.push(ScopeBreach {
                scope,
                reason: DecisionReason::RateLimit,
                count,
                limit: u64::from(limit.limit),
                retry_after,
            });
            if !explain {
                return breaches;
            }
        }
    }

    if limit.daily_cap > 0 {
        let day_start = local_day_start(now, offset_minutes);
        let count = log.count_since(clamp_start(day_start, reset), now);
        if count >= u64::from(limit.daily_cap) {
            breaches.push(ScopeBreach {
                scope,
                reason: DecisionReason::DailyCap,
                count,
                limit: u64::from(limit.daily_cap),
                retry_after: (day_start + TimeDelta::days(1) - now).to_std().ok(),
            });
            if !explain {
                return breaches;
            }
        }
    }

    if limit.weekly_cap > 0 {
        let week_start = local_week_start(now, offset_minutes);
        let count = log.count_since(clamp_start(week_start, reset), now);
        if count >= u64::from(limit.weekly_cap) {
            breaches.push(ScopeBreach {
                scope,
                reason: DecisionReason::WeeklyCap,
                count,
                limit: u64::from(limit.weekly_cap),
                retry_after: (week_start + TimeDelta::days(7) - now).to_std().ok(),
            });
        }
    }

    breaches
}

/// Rolling 30-day customer soft cap: flags, never denies.
fn monthly_soft_cap_signal(
    log: &ScopeLog,
    limit: &ScopeLimit,
    reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<SoftSignal> {
    if limit.monthly_cap == 0 {
        return None;
    }
    let from = clamp_start(now - TimeDelta::days(30), reset);
    let count = log.count_window(from, now);
    if count >= u64::from(limit.monthly_cap) {
        tracing::warn!(count, cap = limit.monthly_cap, "customer monthly soft cap reached");
        Some(SoftSignal {
            factor: CUSTOMER_MONTHLY_SIGNAL.to_string(),
            evidence: json!({ "count": count, "cap": limit.monthly_cap }),
        })
    } else {
        None
    }
}
