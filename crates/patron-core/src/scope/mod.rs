//! Per-scope event logs backing the velocity limiter.
//!
//! Every `(merchant, scope type, scope id)` key owns an independent,
//! mutex-protected append-only log of event timestamps. Cross-key operations
//! never block each other; a single admission touches at most four keys and
//! acquires each key's lock one at a time in the fixed scope order.
//!
//! # Memory Management
//!
//! Two mechanisms bound memory, mirroring the per-IP sliding-window limiter
//! this store generalizes:
//!
//! 1. **Lazy eviction**: entries older than the retention horizon are dropped
//!    inside the locked section on every read, never by a background sweep
//!    that could race a concurrent check.
//! 2. **Hard cap on tracked keys**: when `max_tracked_keys` is reached and an
//!    unknown key arrives, a full cleanup runs first; if the index is still
//!    full the operation fails with [`StoreError::CapacityExhausted`], which
//!    the limiter degrades to a soft flag.
//!
//! # Lock Discipline
//!
//! `try_lock` in a bounded loop stands in for a timed acquisition; the wait
//! bound is configurable and a timeout is reported as
//! [`StoreError::LockTimeout`] so the caller can fail safe instead of
//! blocking a checkout lane indefinitely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Baseline retention: the weekly cap is the longest standard window.
pub const BASE_RETENTION_DAYS: i64 = 7;

/// Extended retention when a merchant enables the rolling monthly soft cap.
pub const MAX_RETENTION_DAYS: i64 = 30;

/// One velocity dimension.
///
/// The variant order is the fixed check (and lock acquisition) order:
/// customer first, merchant last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// Per-customer counters.
    Customer,
    /// Per-cashier counters.
    Staff,
    /// Per-terminal counters.
    Device,
    /// Whole-merchant counters; always applicable.
    Merchant,
}

/// Fixed evaluation order for scope checks; the first breach wins.
pub const SCOPE_CHECK_ORDER: [ScopeType; 4] = [
    ScopeType::Customer,
    ScopeType::Staff,
    ScopeType::Device,
    ScopeType::Merchant,
];

impl ScopeType {
    /// Stable lowercase name, used for metrics labels and log fields.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Staff => "staff",
            Self::Device => "device",
            Self::Merchant => "merchant",
        }
    }
}

impl std::fmt::Display for ScopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one scope's counter log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    /// Owning merchant.
    pub merchant_id: String,
    /// Dimension this key counts.
    pub scope_type: ScopeType,
    /// Identifier within the dimension; equals `merchant_id` for the
    /// merchant scope.
    pub scope_id: String,
}

impl ScopeKey {
    /// Builds a key for the given scope of a merchant.
    #[must_use]
    pub fn new(
        merchant_id: impl Into<String>,
        scope_type: ScopeType,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            merchant_id: merchant_id.into(),
            scope_type,
            scope_id: scope_id.into(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.merchant_id, self.scope_type, self.scope_id)
    }
}

/// Errors surfaced by the store; both degrade to a soft flag upstream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The key's lock could not be acquired within the wait bound.
    #[error("timed out waiting for scope lock: {key}")]
    LockTimeout {
        /// Key whose lock timed out.
        key: ScopeKey,
    },

    /// The tracked-key cap was reached and cleanup reclaimed nothing.
    #[error("scope store capacity exhausted: {tracked} keys tracked")]
    CapacityExhausted {
        /// Number of keys tracked when the insert was refused.
        tracked: usize,
    },
}

/// Append-only timestamp log for one scope key.
///
/// Timestamps are only ever appended and evicted from the front by age;
/// individual entries are never mutated.
#[derive(Debug, Default)]
pub struct ScopeLog {
    events: Vec<DateTime<Utc>>,
}

impl ScopeLog {
    /// Records one admission attempt at `at`.
    pub fn append(&mut self, at: DateTime<Utc>) {
        self.events.push(at);
    }

    /// Drops events at or before `cutoff`; returns how many were removed.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|&t| t > cutoff);
        before - self.events.len()
    }

    /// Counts events in the half-open sliding window `(from, now]`.
    ///
    /// An event exactly `from` old sits on the boundary and does not count.
    #[must_use]
    pub fn count_window(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        self.events.iter().filter(|&&t| t > from && t <= now).count() as u64
    }

    /// Counts events in the closed calendar interval `[start, now]`.
    ///
    /// Calendar caps include an event landing exactly on the period start.
    #[must_use]
    pub fn count_since(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
        self.events.iter().filter(|&&t| t >= start && t <= now).count() as u64
    }

    /// Earliest event inside the half-open window `(from, now]`.
    #[must_use]
    pub fn oldest_in_window(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.events.iter().filter(|&&t| t > from && t <= now).min().copied()
    }

    /// Total retained events, including ones outside any active window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log holds no retained events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Tuning for the keyed store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on waiting for one key's lock.
    pub lock_wait: Duration,

    /// Hard cap on tracked scope keys.
    ///
    /// A busy merchant contributes one key per active customer, staff member
    /// and device; the cap bounds worst-case memory against id spraying.
    pub max_tracked_keys: usize,

    /// Run a full cleanup every N store operations.
    pub cleanup_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_millis(250),
            max_tracked_keys: 100_000,
            cleanup_interval: 512,
        }
    }
}

/// Keyed store of independently locked scope logs.
pub struct ScopeEventStore {
    config: StoreConfig,
    index: RwLock<HashMap<ScopeKey, Arc<Mutex<ScopeLog>>>>,
    // Counter driving periodic cleanup.
    op_count: AtomicU64,
}

impl ScopeEventStore {
    /// Creates an empty store with the given tuning.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            index: RwLock::new(HashMap::new()),
            op_count: AtomicU64::new(0),
        }
    }

    /// Runs `f` against the key's log under its lock.
    ///
    /// The log handle is resolved (or created) first, then the lock is
    /// acquired with a bounded wait. `now` drives the periodic cleanup
    /// cutoff.
    ///
    /// # Errors
    ///
    /// [`StoreError::LockTimeout`] when the lock wait bound elapses,
    /// [`StoreError::CapacityExhausted`] when the key index is full and
    /// cleanup cannot reclaim space.
    pub fn with_log<T>(
        &self,
        key: &ScopeKey,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut ScopeLog) -> T,
    ) -> Result<T, StoreError> {
        let count = self.op_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            tracing::debug!(op_count = count, "running periodic scope store cleanup");
            self.cleanup(now - TimeDelta::days(MAX_RETENTION_DAYS));
        }

        let handle = self.log_handle(key, now)?;
        let deadline = Instant::now() + self.config.lock_wait;
        let mut guard = loop {
            match handle.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(key = %key, "scope lock wait bound exceeded");
                        return Err(StoreError::LockTimeout { key: key.clone() });
                    }
                    std::thread::yield_now();
                },
            }
        };
        Ok(f(&mut guard))
    }

    /// Removes keys whose logs are empty after evicting up to `cutoff`.
    ///
    /// Keys whose locks are currently held are skipped; they are active and
    /// will be revisited by a later cleanup.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) {
        let mut index = self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        index.retain(|_, handle| match handle.try_lock() {
            Ok(mut log) => {
                log.evict_older_than(cutoff);
                !log.is_empty()
            },
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut log = poisoned.into_inner();
                log.evict_older_than(cutoff);
                !log.is_empty()
            },
            Err(TryLockError::WouldBlock) => true,
        });
    }

    /// Number of scope keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn log_handle(&self, key: &ScopeKey, now: DateTime<Utc>) -> Result<Arc<Mutex<ScopeLog>>, StoreError> {
        {
            let index = self.index.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(handle) = index.get(key) {
                return Ok(Arc::clone(handle));
            }
            if index.len() >= self.config.max_tracked_keys {
                drop(index);
                tracing::debug!(
                    max_tracked_keys = self.config.max_tracked_keys,
                    "scope key cap reached, forcing cleanup"
                );
                self.cleanup(now - TimeDelta::days(MAX_RETENTION_DAYS));
            }
        }

        let mut index = self.index.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = index.get(key) {
            return Ok(Arc::clone(handle));
        }
        if index.len() >= self.config.max_tracked_keys {
            tracing::warn!(
                key = %key,
                tracked = index.len(),
                "refusing new scope key: store capacity exhausted"
            );
            return Err(StoreError::CapacityExhausted { tracked: index.len() });
        }
        let handle = Arc::new(Mutex::new(ScopeLog::default()));
        index.insert(key.clone(), Arc::clone(&handle));
        Ok(handle)
    }
}

impl std::fmt::Debug for ScopeEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeEventStore")
            .field("config", &self.config)
            .field("tracked_keys", &self.tracked_keys())
            .finish_non_exhaustive()
    }
}
