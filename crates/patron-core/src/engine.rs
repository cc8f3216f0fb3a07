//! `AdmissionEngine`: the single entry point for transaction admission.
//!
//! The engine owns the canonical evaluation order for one attempt:
//! resolve effective rates through the rule engine, then gate the attempt
//! through the velocity limiter against the merchant's configuration
//! snapshot and active findings. The preview surface reuses exactly the
//! same rule resolution with no limiter side effects, so a merchant
//! dry-running a scenario observes production semantics.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use patron_core::config::{MemoryConfigSource, MerchantConfig, RuleSet};
//! use patron_core::engine::AdmissionEngine;
//! use patron_core::types::{Channel, RateQuery};
//!
//! let source = Arc::new(MemoryConfigSource::new());
//! let mut config = MerchantConfig::new("M-1");
//! config.rules =
//!     RuleSet::parse(r#"[{"if":{"channelIn":["SMART"]},"then":{"earnBps":700}}]"#).unwrap();
//! source.upsert(config).unwrap();
//!
//! let engine = AdmissionEngine::new(source).unwrap();
//! let rates = engine
//!     .preview("M-1", &RateQuery {
//!         channel: Channel::Smart,
//!         weekday: 2,
//!         eligible_total: 1000,
//!         category: None,
//!     })
//!     .unwrap();
//! assert_eq!(rates.earn_bps, 700);
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::anomaly::{AnomalyDetector, AnomalyFinding, DetectorConfig, FindingRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ConfigSource};
use crate::ledger::{LedgerError, LedgerReader};
use crate::limiter::{AdmissionDecision, AdmissionExplanation, VelocityLimiter};
use crate::metrics::{AdmissionMetrics, MetricsError};
use crate::rules::{EffectiveRates, resolve};
use crate::scope::{ScopeEventStore, StoreConfig};
use crate::types::{RateQuery, TransactionContext};

/// Errors surfaced by the engine facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Configuration could not be loaded for the merchant.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The ledger collaborator failed during a detector sweep.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Metrics registration failed at construction.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Rates plus decision for one admitted-or-denied attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// Effective rates the rule engine resolved for the attempt.
    pub rates: EffectiveRates,
    /// The limiter's decision.
    pub decision: AdmissionDecision,
}

/// Facade wiring configuration, rule resolution, limiting, findings, and
/// metrics.
pub struct AdmissionEngine {
    config: Arc<dyn ConfigSource>,
    limiter: VelocityLimiter,
    registry: Arc<FindingRegistry>,
    detector: AnomalyDetector,
    metrics: AdmissionMetrics,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    /// Creates an engine with default store/detector tuning and the system
    /// clock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Metrics`] if counter registration fails.
    pub fn new(config: Arc<dyn ConfigSource>) -> Result<Self, EngineError> {
        Self::with_parts(config, StoreConfig::default(), DetectorConfig::default(), Arc::new(SystemClock))
    }

    /// Creates a fully parameterized engine; tests inject a manual clock
    /// here.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Metrics`] if counter registration fails.
    pub fn with_parts(
        config: Arc<dyn ConfigSource>,
        store_config: StoreConfig,
        detector_config: DetectorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(ScopeEventStore::new(store_config));
        let limiter = VelocityLimiter::new(store, Arc::clone(&clock));
        Ok(Self {
            config,
            limiter,
            registry: Arc::new(FindingRegistry::new()),
            detector: AnomalyDetector::new(detector_config),
            metrics: AdmissionMetrics::new()?,
            clock,
        })
    }

    /// Decides one transaction attempt.
    ///
    /// Synchronous and low-latency: one config snapshot read, pure rule
    /// resolution, then at most four scope-key lock acquisitions. The scope
    /// events backing the decision are committed before this returns, so an
    /// abandoning caller cannot escape its velocity counters.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the merchant has no
    /// configuration; limiter outcomes are values in
    /// [`AdmissionOutcome::decision`], never errors.
    pub fn admit(&self, ctx: &TransactionContext) -> Result<AdmissionOutcome, EngineError> {
        let config = self.config.merchant_config(&ctx.merchant_id)?;
        let rates = resolve(&config.rules, config.baseline, &ctx.rate_query());
        let decision = self.limiter.admit(ctx, &config, &self.registry);
        self.metrics.observe_decision(&decision);
        tracing::debug!(
            merchant_id = %ctx.merchant_id,
            verdict = decision.verdict.as_str(),
            reason = decision.reason.as_str(),
            earn_bps = rates.earn_bps,
            "admission decided"
        );
        Ok(AdmissionOutcome { rates, decision })
    }

    /// Decides one attempt with full per-scope diagnostics.
    ///
    /// # Errors
    ///
    /// Same contract as [`AdmissionEngine::admit`].
    pub fn admit_explained(
        &self,
        ctx: &TransactionContext,
    ) -> Result<(EffectiveRates, AdmissionExplanation), EngineError> {
        let config = self.config.merchant_config(&ctx.merchant_id)?;
        let rates = resolve(&config.rules, config.baseline, &ctx.rate_query());
        let explanation = self.limiter.admit_explained(ctx, &config, &self.registry);
        self.metrics.observe_decision(&explanation.decision);
        Ok((rates, explanation))
    }

    /// Dry-runs rule resolution for the admin rule tester.
    ///
    /// Calls exactly the production rule engine; no scope event is recorded
    /// and no counter moves.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the merchant has no
    /// configuration.
    pub fn preview(&self, merchant_id: &str, query: &RateQuery) -> Result<EffectiveRates, EngineError> {
        let config = self.config.merchant_config(merchant_id)?;
        Ok(resolve(&config.rules, config.baseline, query))
    }

    /// Runs the anomaly detector over a ledger window and registers the
    /// findings.
    ///
    /// Intended for the periodic sweep owned by the reporting collaborator;
    /// it never runs on the admission hot path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Ledger`] when the ledger read fails and
    /// [`EngineError::Config`] when the merchant has no configuration.
    pub fn refresh_findings(
        &self,
        ledger: &dyn LedgerReader,
        merchant_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AnomalyFinding>, EngineError> {
        let config = self.config.merchant_config(merchant_id)?;
        let transactions = ledger.list_transactions(merchant_id, from, to)?;
        let receipts = ledger.list_receipts(merchant_id, self.detector.config().receipt_sample_limit)?;
        let findings = self.detector.scan(
            merchant_id,
            &transactions,
            &receipts,
            config.utc_offset_minutes,
            self.clock.now(),
        );
        for finding in &findings {
            self.metrics.observe_finding(finding);
        }
        tracing::debug!(
            merchant_id,
            transactions = transactions.len(),
            receipts = receipts.len(),
            findings = findings.len(),
            "anomaly sweep complete"
        );
        self.registry.extend(findings.clone());
        Ok(findings)
    }

    /// The active-finding registry, shared with operator tooling that
    /// raises and clears findings.
    #[must_use]
    pub fn registry(&self) -> &Arc<FindingRegistry> {
        &self.registry
    }

    /// Prometheus text exposition of the engine's counters.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Metrics`] if encoding fails.
    pub fn metrics_text(&self) -> Result<String, EngineError> {
        Ok(self.metrics.encode_text()?)
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("limiter", &self.limiter)
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}
