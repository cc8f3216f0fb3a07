//! End-to-end admission flow: configuration in, rule resolution, velocity
//! gating, detector sweep, hard block, operator clear.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use patron_core::anomaly::{DetectorConfig, factors};
use patron_core::clock::{Clock, ManualClock};
use patron_core::config::{MemoryConfigSource, MerchantConfig, RuleSet, ScopeLimit, ScopeLimits};
use patron_core::engine::AdmissionEngine;
use patron_core::ledger::{LedgerTransaction, MemoryLedger};
use patron_core::limiter::{AdmissionVerdict, DecisionReason};
use patron_core::scope::StoreConfig;
use patron_core::types::{Channel, RateQuery, TransactionContext, TransactionKind};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
}

fn merchant_config() -> MerchantConfig {
    let mut config = MerchantConfig::new("M-1");
    config.rules = RuleSet::parse(
        r#"[{"if":{"channelIn":["SMART"],"minEligible":500},"then":{"earnBps":700}},
            {"if":{"weekdayIn":[6,0]},"then":{"earnBps":600,"redeemLimitBps":3000}}]"#,
    )
    .unwrap();
    config.limits = ScopeLimits {
        customer: ScopeLimit { limit: 3, window_secs: 3600, ..ScopeLimit::default() },
        staff: ScopeLimit::default(),
        device: ScopeLimit::default(),
        merchant: ScopeLimit::default(),
    };
    config.block_factors.insert(factors::EARN_REDEEM_PATTERN.to_string());
    config
}

fn build_engine() -> (AdmissionEngine, Arc<ManualClock>) {
    let source = Arc::new(MemoryConfigSource::new());
    source.upsert(merchant_config()).unwrap();
    let clock = Arc::new(ManualClock::new(start()));
    let engine = AdmissionEngine::with_parts(
        source,
        StoreConfig::default(),
        DetectorConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
    )
    .unwrap();
    (engine, clock)
}

fn earn_ctx(customer: &str, eligible_total: i64) -> TransactionContext {
    TransactionContext {
        merchant_id: "M-1".into(),
        kind: TransactionKind::Earn,
        channel: Channel::Smart,
        weekday: 1,
        eligible_total,
        category: None,
        customer_id: Some(customer.into()),
        staff_id: Some("S-1".into()),
        device_id: Some("D-1".into()),
        occurred_at: start(),
    }
}

#[test]
fn full_flow_from_rules_to_hard_block_and_back() {
    let (engine, clock) = build_engine();

    // 1. Rates resolve through the first matching rule.
    let outcome = engine.admit(&earn_ctx("C-1", 1000)).unwrap();
    assert!(outcome.decision.is_admitted());
    assert_eq!(outcome.rates.earn_bps, 700);
    assert_eq!(outcome.rates.redeem_limit_bps, 5000);
    assert_eq!(outcome.rates.earn_points(1000), 70);

    // 2. The preview endpoint sees exactly the same resolution.
    let previewed = engine
        .preview("M-1", &RateQuery {
            channel: Channel::Smart,
            weekday: 1,
            eligible_total: 1000,
            category: None,
        })
        .unwrap();
    assert_eq!(previewed, outcome.rates);

    // 3. The customer velocity limit kicks in on the fourth attempt.
    clock.advance_secs(1);
    assert!(engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision.is_admitted());
    clock.advance_secs(1);
    assert!(engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision.is_admitted());
    clock.advance_secs(1);
    let denied = engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision;
    assert_eq!(denied.verdict, AdmissionVerdict::SoftFlag);
    assert_eq!(denied.reason, DecisionReason::RateLimit);
    assert!(denied.retry_after.is_some());

    // 4. A detector sweep over suspicious ledger history raises a finding
    //    for a factor the merchant block-lists.
    let ledger = MemoryLedger::new();
    ledger.push_transaction(tx("t1", "C-2", TransactionKind::Earn, 1000, start()));
    ledger.push_transaction(tx(
        "t2",
        "C-2",
        TransactionKind::Redeem,
        -950,
        start() + TimeDelta::minutes(1),
    ));
    let findings = engine
        .refresh_findings(&ledger, "M-1", start() - TimeDelta::days(1), start() + TimeDelta::days(1))
        .unwrap();
    assert!(findings.iter().any(|f| f.factor == factors::EARN_REDEEM_PATTERN));

    // 5. The flagged customer is hard-blocked, independent of velocity.
    let blocked = engine.admit(&earn_ctx("C-2", 100)).unwrap().decision;
    assert_eq!(blocked.verdict, AdmissionVerdict::HardBlock);
    assert_eq!(blocked.reason, DecisionReason::BlockFactor);
    // The end-user message never names the factor.
    assert!(!blocked.public_message().contains(factors::EARN_REDEEM_PATTERN));

    // 6. An operator clears the factor; the customer is admitted again.
    engine.registry().clear_factor("M-1", factors::EARN_REDEEM_PATTERN);
    assert!(engine.admit(&earn_ctx("C-2", 100)).unwrap().decision.is_admitted());

    // 7. Metrics carried every decision.
    let text = engine.metrics_text().unwrap();
    assert!(text.contains("patron_admission_decisions_total"));
    assert!(text.contains("patron_anomaly_findings_total"));
}

#[test]
fn window_slide_readmits_after_rate_limit() {
    let (engine, clock) = build_engine();

    for _ in 0..3 {
        assert!(engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision.is_admitted());
    }
    clock.advance_secs(1);
    assert_eq!(
        engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision.reason,
        DecisionReason::RateLimit
    );

    clock.set(start() + TimeDelta::seconds(3601));
    assert!(engine.admit(&earn_ctx("C-1", 1000)).unwrap().decision.is_admitted());
}

fn tx(
    id: &str,
    customer: &str,
    kind: TransactionKind,
    amount: i64,
    at: DateTime<Utc>,
) -> LedgerTransaction {
    LedgerTransaction {
        id: id.into(),
        merchant_id: "M-1".into(),
        customer_id: Some(customer.into()),
        outlet_id: Some("O-1".into()),
        device_id: Some("D-1".into()),
        staff_id: Some("S-1".into()),
        kind,
        amount,
        occurred_at: at,
    }
}
