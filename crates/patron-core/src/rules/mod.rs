//! First-match-wins resolution of effective cashback rates.
//!
//! `resolve` is a pure function over a validated [`RuleSet`]: rules are
//! scanned in declaration order, the first rule whose condition holds wins,
//! and its effect is merged field-by-field onto the merchant baseline. No
//! rule matching means the baseline passes through unchanged.
//!
//! The admin preview surface and the live admission path both call this
//! function with the same inputs, so a merchant dry-running a scenario sees
//! exactly what production evaluation will do.

use serde::{Deserialize, Serialize};

use crate::config::{RateBaseline, RuleCondition, RuleSet};
use crate::types::{MAX_BPS, RateQuery};

/// Rates that apply to one transaction after rule resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveRates {
    /// Earn rate in basis points.
    #[serde(rename = "earnBps")]
    pub earn_bps: u16,

    /// Redemption limit in basis points.
    #[serde(rename = "redeemLimitBps")]
    pub redeem_limit_bps: u16,
}

impl EffectiveRates {
    /// Points earned for an eligible amount at this earn rate.
    ///
    /// Bps arithmetic rounds down, matching the ledger's accrual math.
    #[must_use]
    pub const fn earn_points(&self, eligible_total: i64) -> i64 {
        eligible_total.saturating_mul(self.earn_bps as i64) / 10_000
    }

    /// Maximum redeemable amount for an eligible total at this limit.
    #[must_use]
    pub const fn redeem_limit(&self, eligible_total: i64) -> i64 {
        eligible_total.saturating_mul(self.redeem_limit_bps as i64) / 10_000
    }
}

impl From<RateBaseline> for EffectiveRates {
    fn from(baseline: RateBaseline) -> Self {
        Self {
            earn_bps: baseline.earn_bps,
            redeem_limit_bps: baseline.redeem_limit_bps,
        }
    }
}

/// Resolves the effective rates for a query against a merchant's rules.
///
/// Deterministic and side-effect free: identical inputs always produce
/// identical output, and evaluation never fails — invalid configuration is
/// rejected when it is saved, not here.
#[must_use]
pub fn resolve(rules: &RuleSet, baseline: RateBaseline, query: &RateQuery) -> EffectiveRates {
    for rule in &rules.rules {
        let matches = match &rule.condition {
            None => true,
            Some(condition) => condition_matches(condition, query),
        };
        if matches {
            // Field-wise merge; rates stay inside 0..=10000 even if an
            // unvalidated set slips through.
            return EffectiveRates {
                earn_bps: rule.effect.earn_bps.unwrap_or(baseline.earn_bps).min(MAX_BPS),
                redeem_limit_bps: rule
                    .effect
                    .redeem_limit_bps
                    .unwrap_or(baseline.redeem_limit_bps)
                    .min(MAX_BPS),
            };
        }
    }
    baseline.into()
}

/// Evaluates a condition as the conjunction of its present fields.
fn condition_matches(condition: &RuleCondition, query: &RateQuery) -> bool {
    if let Some(channels) = &condition.channel_in {
        if !channels.contains(&query.channel) {
            return false;
        }
    }
    if let Some(weekdays) = &condition.weekday_in {
        if !weekdays.contains(&query.weekday) {
            return false;
        }
    }
    if let Some(min_eligible) = condition.min_eligible {
        if query.eligible_total < min_eligible {
            return false;
        }
    }
    if let Some(categories) = &condition.category_in {
        match &query.category {
            Some(category) if categories.iter().any(|c| c == category) => {},
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Rule, RuleEffect};
    use crate::types::Channel;

    fn baseline() -> RateBaseline {
        RateBaseline { earn_bps: 500, redeem_limit_bps: 5000 }
    }

    fn query(channel: Channel, weekday: u8, eligible_total: i64) -> RateQuery {
        RateQuery { channel, weekday, eligible_total, category: None }
    }

    fn rule(json: &str) -> RuleSet {
        RuleSet::parse(json).unwrap()
    }

    #[test]
    fn test_empty_rule_set_yields_baseline() {
        let rates = resolve(&RuleSet::default(), baseline(), &query(Channel::Smart, 2, 1000));
        assert_eq!(rates, EffectiveRates { earn_bps: 500, redeem_limit_bps: 5000 });
    }

    #[test]
    fn test_channel_rule_overrides_earn_only() {
        // Scenario from the rule tester: SMART channel bumps earn to 7%,
        // redeem limit stays at the baseline.
        let rules = rule(r#"[{"if":{"channelIn":["SMART"]},"then":{"earnBps":700}}]"#);
        let rates = resolve(&rules, baseline(), &query(Channel::Smart, 2, 1000));
        assert_eq!(rates, EffectiveRates { earn_bps: 700, redeem_limit_bps: 5000 });
    }

    #[test]
    fn test_non_matching_channel_falls_through() {
        let rules = rule(r#"[{"if":{"channelIn":["SMART"]},"then":{"earnBps":700}}]"#);
        let rates = resolve(&rules, baseline(), &query(Channel::Virtual, 2, 1000));
        assert_eq!(rates, EffectiveRates { earn_bps: 500, redeem_limit_bps: 5000 });
    }

    #[test]
    fn test_first_match_wins_over_later_rules() {
        let rules = rule(
            r#"[{"if":{"channelIn":["SMART"]},"then":{"earnBps":700}},
                {"if":{"channelIn":["SMART"]},"then":{"earnBps":900,"redeemLimitBps":1000}}]"#,
        );
        let rates = resolve(&rules, baseline(), &query(Channel::Smart, 2, 1000));
        assert_eq!(rates, EffectiveRates { earn_bps: 700, redeem_limit_bps: 5000 });
    }

    #[test]
    fn test_condition_is_a_conjunction() {
        let rules = rule(
            r#"[{"if":{"channelIn":["SMART"],"weekdayIn":[6,0],"minEligible":1000},
                 "then":{"earnBps":800}}]"#,
        );
        // All three sub-conditions hold.
        assert_eq!(
            resolve(&rules, baseline(), &query(Channel::Smart, 6, 1000)).earn_bps,
            800
        );
        // Weekday misses.
        assert_eq!(
            resolve(&rules, baseline(), &query(Channel::Smart, 3, 1000)).earn_bps,
            500
        );
        // Amount below the minimum (boundary is inclusive).
        assert_eq!(
            resolve(&rules, baseline(), &query(Channel::Smart, 6, 999)).earn_bps,
            500
        );
    }

    #[test]
    fn test_category_match_is_case_sensitive() {
        let rules = rule(r#"[{"if":{"categoryIn":["Coffee"]},"then":{"earnBps":900}}]"#);
        let mut q = query(Channel::Virtual, 1, 500);
        q.category = Some("Coffee".into());
        assert_eq!(resolve(&rules, baseline(), &q).earn_bps, 900);
        q.category = Some("coffee".into());
        assert_eq!(resolve(&rules, baseline(), &q).earn_bps, 500);
        // A category condition never matches a query without a category.
        q.category = None;
        assert_eq!(resolve(&rules, baseline(), &q).earn_bps, 500);
    }

    #[test]
    fn test_unconditional_rule_always_matches() {
        let rules = rule(r#"[{"then":{"redeemLimitBps":2000}}]"#);
        let rates = resolve(&rules, baseline(), &query(Channel::PcPos, 4, 50));
        assert_eq!(rates, EffectiveRates { earn_bps: 500, redeem_limit_bps: 2000 });
    }

    #[test]
    fn test_empty_channel_set_never_matches() {
        // Structurally valid but unsatisfiable condition: skipped, later
        // rules still evaluated.
        let rules = rule(
            r#"[{"if":{"channelIn":[]},"then":{"earnBps":900}},
                {"then":{"earnBps":600}}]"#,
        );
        assert_eq!(resolve(&rules, baseline(), &query(Channel::Smart, 1, 100)).earn_bps, 600);
    }

    #[test]
    fn test_points_math_rounds_down() {
        let rates = EffectiveRates { earn_bps: 333, redeem_limit_bps: 5000 };
        assert_eq!(rates.earn_points(1000), 33);
        assert_eq!(rates.redeem_limit(999), 499);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        fn arb_channel() -> impl Strategy<Value = Channel> {
            prop_oneof![
                Just(Channel::Virtual),
                Just(Channel::PcPos),
                Just(Channel::Smart),
            ]
        }

        fn arb_rule() -> impl Strategy<Value = Rule> {
            (
                proptest::option::of(proptest::collection::vec(arb_channel(), 0..3)),
                proptest::option::of(proptest::collection::vec(0u8..7, 0..4)),
                proptest::option::of(0i64..100_000),
                proptest::option::of(0u16..=10_000),
                proptest::option::of(0u16..=10_000),
            )
                .prop_map(|(channel_in, weekday_in, min_eligible, earn, redeem)| Rule {
                    condition: Some(RuleCondition {
                        channel_in,
                        weekday_in,
                        min_eligible,
                        category_in: None,
                    }),
                    effect: RuleEffect { earn_bps: earn, redeem_limit_bps: redeem },
                })
        }

        proptest! {
            #[test]
            fn resolve_is_deterministic(
                rules in proptest::collection::vec(arb_rule(), 0..8),
                channel in arb_channel(),
                weekday in 0u8..7,
                eligible_total in 0i64..1_000_000,
            ) {
                let set = RuleSet { rules };
                let base = RateBaseline { earn_bps: 500, redeem_limit_bps: 5000 };
                let q = RateQuery { channel, weekday, eligible_total, category: None };
                prop_assert_eq!(resolve(&set, base, &q), resolve(&set, base, &q));
            }

            #[test]
            fn resolved_rates_stay_in_range(
                rules in proptest::collection::vec(arb_rule(), 0..8),
                channel in arb_channel(),
                weekday in 0u8..7,
                eligible_total in 0i64..1_000_000,
            ) {
                let set = RuleSet { rules };
                let base = RateBaseline { earn_bps: 500, redeem_limit_bps: 5000 };
                let q = RateQuery { channel, weekday, eligible_total, category: None };
                let rates = resolve(&set, base, &q);
                prop_assert!(rates.earn_bps <= MAX_BPS);
                prop_assert!(rates.redeem_limit_bps <= MAX_BPS);
            }

            #[test]
            fn no_match_yields_baseline(
                channel in arb_channel(),
                weekday in 0u8..7,
                eligible_total in 0i64..1_000_000,
            ) {
                // A rule set whose every condition is unsatisfiable.
                let set = RuleSet {
                    rules: vec![Rule {
                        condition: Some(RuleCondition {
                            channel_in: Some(vec![]),
                            ..RuleCondition::default()
                        }),
                        effect: RuleEffect { earn_bps: Some(1), redeem_limit_bps: Some(1) },
                    }],
                };
                let base = RateBaseline { earn_bps: 500, redeem_limit_bps: 5000 };
                let q = RateQuery { channel, weekday, eligible_total, category: None };
                prop_assert_eq!(resolve(&set, base, &q), EffectiveRates::from(base));
            }
        }
    }
}
