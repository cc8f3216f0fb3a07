//! Prometheus metrics for admission-path observability.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `patron_admission_decisions_total` | Counter | `verdict`, `reason` |
//! | `patron_admission_block_factor_total` | Counter | `factor` |
//! | `patron_anomaly_findings_total` | Counter | `factor` |
//!
//! Each engine owns its registry, so embedding several engines in one
//! process never trips duplicate-registration errors.

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::anomaly::{AnomalyFinding, base_factor};
use crate::limiter::AdmissionDecision;

/// Errors from metric registration or encoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// A collector could not be created or registered.
    #[error("metrics registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    /// The text exposition could not be encoded.
    #[error("metrics encoding failed: {message}")]
    Encoding {
        /// Encoder diagnostic.
        message: String,
    },
}

/// Counter families for one admission engine.
#[derive(Debug)]
pub struct AdmissionMetrics {
    registry: Registry,
    decisions: CounterVec,
    block_factors: CounterVec,
    findings: CounterVec,
}

impl AdmissionMetrics {
    /// Creates and registers the counter families.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Registration`] if a collector cannot be
    /// registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let decisions = CounterVec::new(
            Opts::new("patron_admission_decisions_total", "Admission decisions by verdict and reason"),
            &["verdict", "reason"],
        )?;
        registry.register(Box::new(decisions.clone()))?;

        let block_factors = CounterVec::new(
            Opts::new("patron_admission_block_factor_total", "Hard blocks by triggering factor"),
            &["factor"],
        )?;
        registry.register(Box::new(block_factors.clone()))?;

        let findings = CounterVec::new(
            Opts::new("patron_anomaly_findings_total", "Anomaly findings by factor"),
            &["factor"],
        )?;
        registry.register(Box::new(findings.clone()))?;

        Ok(Self { registry, decisions, block_factors, findings })
    }

    /// Records one admission decision.
    pub fn observe_decision(&self, decision: &AdmissionDecision) {
        self.decisions
            .with_label_values(&[decision.verdict.as_str(), decision.reason.as_str()])
            .inc();
        if let Some(factor) = &decision.triggered_factor {
            self.block_factors.with_label_values(&[base_factor(factor)]).inc();
        }
    }

    /// Records one anomaly finding.
    pub fn observe_finding(&self, finding: &AnomalyFinding) {
        self.findings.with_label_values(&[base_factor(&finding.factor)]).inc();
    }

    /// Encodes the registry in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| MetricsError::Encoding { message: err.to_string() })
    }
}
