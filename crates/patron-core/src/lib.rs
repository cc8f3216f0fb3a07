//! patron-core - Transaction admission control for the Patron loyalty
//! platform.
//!
//! Every point-earning or point-redeeming event passes through this crate
//! twice over: the rule engine resolves the cashback rate and redemption
//! limit the merchant's declarative rules assign to the transaction, and the
//! velocity limiter decides — under concurrent load and overlapping scopes —
//! whether the event is admitted, soft-flagged, or hard-blocked.
//!
//! Persistence, HTTP surfaces, notifications and authentication live in
//! collaborating services; this crate exposes traits for the two
//! collaborators it reads from ([`config::ConfigSource`],
//! [`ledger::LedgerReader`]) and keeps the hot path synchronous and
//! allocation-light.
//!
//! # Modules
//!
//! - [`engine`]: `AdmissionEngine` facade — `admit`, `admit_explained`,
//!   `preview`, and the detector sweep
//! - [`rules`]: pure first-match-wins rate resolution, shared by the live
//!   path and the admin preview
//! - [`limiter`]: velocity/caps enforcement with typed
//!   [`limiter::AdmissionDecision`] outcomes
//! - [`scope`]: per-key append-only event logs with lazy eviction and
//!   bounded lock waits
//! - [`anomaly`]: batch heuristics, the active-finding registry, risk
//!   scoring and factor statistics
//! - [`config`]: merchant configuration schema, validation, and the
//!   configuration-source contract
//! - [`ledger`]: read contract against the transaction/receipt ledger
//! - [`clock`]: injectable time source and merchant-local calendar math
//! - [`metrics`]: Prometheus counters for decisions, block factors and
//!   findings
//! - [`types`]: shared domain primitives (`TransactionContext`, `Channel`,
//!   money/bps conventions)

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limiter;
pub mod metrics;
pub mod rules;
pub mod scope;
pub mod types;

pub use anomaly::{AnomalyDetector, AnomalyFinding, AnomalySubject, FindingRegistry};
pub use config::{ConfigError, ConfigSource, MerchantConfig, RuleSet};
pub use engine::{AdmissionEngine, AdmissionOutcome, EngineError};
pub use limiter::{AdmissionDecision, AdmissionVerdict, DecisionReason, VelocityLimiter};
pub use rules::{EffectiveRates, resolve};
pub use types::{Channel, RateQuery, TransactionContext, TransactionKind};
