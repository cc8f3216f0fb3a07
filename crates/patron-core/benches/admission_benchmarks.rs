//! Hot-path latency benchmarks: rule resolution and full admission.

use std::hint::black_box;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use criterion::{Criterion, criterion_group, criterion_main};
use patron_core::anomaly::FindingRegistry;
use patron_core::clock::{Clock, ManualClock};
use patron_core::config::{MerchantConfig, RateBaseline, RuleSet, ScopeLimit};
use patron_core::limiter::VelocityLimiter;
use patron_core::rules::resolve;
use patron_core::scope::{ScopeEventStore, StoreConfig};
use patron_core::types::{Channel, RateQuery, TransactionContext, TransactionKind};

fn rule_set(rules: usize) -> RuleSet {
    let mut items = Vec::new();
    for i in 0..rules {
        items.push(format!(
            r#"{{"if":{{"channelIn":["PC_POS"],"minEligible":{}}},"then":{{"earnBps":{}}}}}"#,
            (i + 1) * 1000,
            100 + i
        ));
    }
    RuleSet::parse(&format!("[{}]", items.join(","))).unwrap()
}

fn bench_resolve(c: &mut Criterion) {
    let rules = rule_set(16);
    let baseline = RateBaseline::default();
    // The query misses every rule, forcing a full scan.
    let query = RateQuery {
        channel: Channel::Smart,
        weekday: 3,
        eligible_total: 500,
        category: None,
    };
    c.bench_function("resolve_16_rules_no_match", |b| {
        b.iter(|| resolve(black_box(&rules), black_box(baseline), black_box(&query)));
    });

    let first_match = RateQuery {
        channel: Channel::PcPos,
        weekday: 3,
        eligible_total: 1_000_000,
        category: None,
    };
    c.bench_function("resolve_16_rules_first_match", |b| {
        b.iter(|| resolve(black_box(&rules), black_box(baseline), black_box(&first_match)));
    });
}

fn bench_admit(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()));
    let store = Arc::new(ScopeEventStore::new(StoreConfig::default()));
    let limiter = VelocityLimiter::new(store, Arc::clone(&clock) as Arc<dyn Clock>);
    let registry = FindingRegistry::new();

    let mut config = MerchantConfig::new("M-1");
    // High ceilings on every scope so the bench measures the admit path,
    // not denials.
    let roomy = ScopeLimit { limit: u32::MAX, window_secs: 3600, ..ScopeLimit::default() };
    config.limits.customer = roomy;
    config.limits.staff = roomy;
    config.limits.device = roomy;
    config.limits.merchant = roomy;

    let ctx = TransactionContext {
        merchant_id: "M-1".into(),
        kind: TransactionKind::Earn,
        channel: Channel::Smart,
        weekday: 1,
        eligible_total: 1000,
        category: None,
        customer_id: Some("C-1".into()),
        staff_id: Some("S-1".into()),
        device_id: Some("D-1".into()),
        occurred_at: clock.now(),
    };

    c.bench_function("admit_four_scopes", |b| {
        b.iter(|| {
            // Keep the clock moving so logs do not grow unboundedly inside
            // one sliding window.
            clock.advance_ms(10);
            black_box(limiter.admit(black_box(&ctx), black_box(&config), black_box(&registry)))
        });
    });
}

criterion_group!(benches, bench_resolve, bench_admit);
criterion_main!(benches);
