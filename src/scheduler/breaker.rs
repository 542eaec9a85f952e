//! Per-dependency circuit breakers.
//!
//! A breaker tracks failures of one external dependency (e.g.
//! `ai_generation`, `spotify_api`) and moves through three states:
//!
//! ```text
//!   closed ──(failures >= threshold)──▶ open
//!     ▲                                  │
//!     │                      (cool-down elapsed,
//!  (successes >= success_threshold)   next evaluation)
//!     │                                  ▼
//!     └────────────── half_open ◀────────┘
//!                         │
//!                   (any failure) ──▶ open
//! ```
//!
//! Breakers are advisory: callers consult [`CircuitBreakerRegistry::is_circuit_open`]
//! before calling the dependency. State lives in the shared store under
//! `breaker:{dependency}` so every process observes the same breaker.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{Keys, OrderedStore};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric form used by the breaker state gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Failures that trip a closed breaker.
    pub threshold: u32,
    /// Cool-down after the last failure before probing.
    pub timeout: Duration,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Default settings plus per-dependency overrides.
#[derive(Debug, Clone, Default)]
pub struct BreakerConfig {
    defaults: BreakerSettings,
    overrides: BTreeMap<String, BreakerSettings>,
}

impl BreakerConfig {
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    /// Defaults plus the overrides known for built-in dependencies.
    ///
    /// `spotify_api` rate-limits aggressively, so it trips after 3 failures
    /// and half-opens after 30 seconds.
    pub fn with_builtin_overrides(defaults: BreakerSettings) -> Self {
        let success_threshold = defaults.success_threshold;
        Self::new(defaults).with_override(
            "spotify_api",
            BreakerSettings {
                threshold: 3,
                timeout: Duration::from_secs(30),
                success_threshold,
            },
        )
    }

    pub fn with_override(mut self, dependency: impl Into<String>, settings: BreakerSettings) -> Self {
        self.overrides.insert(dependency.into(), settings);
        self
    }

    pub fn settings_for(&self, dependency: &str) -> &BreakerSettings {
        self.overrides.get(dependency).unwrap_or(&self.defaults)
    }
}

/// Breaker state for one dependency, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub dependency: String,
    pub state: CircuitState,
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    /// Consecutive successes while half-open.
    pub success_count: u32,
    pub threshold: u32,
    pub timeout_ms: u64,
    pub success_threshold: u32,
}

impl CircuitBreaker {
    /// Creates a closed breaker with zero failures.
    pub fn new(dependency: impl Into<String>, settings: &BreakerSettings) -> Self {
        Self {
            dependency: dependency.into(),
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            success_count: 0,
            threshold: settings.threshold,
            timeout_ms: settings.timeout.as_millis() as u64,
            success_threshold: settings.success_threshold,
        }
    }

    /// Applies the open → half-open transition if the cool-down elapsed.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> CircuitState {
        if self.state == CircuitState::Open {
            let cooled_down = self.last_failure.map_or(true, |at| {
                (now - at).num_milliseconds() > self.timeout_ms as i64
            });
            if cooled_down {
                self.state = CircuitState::HalfOpen;
                self.success_count = 0;
            }
        }
        self.state
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        match self.evaluate(now) {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Closed => self.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        let state = self.evaluate(now);
        self.last_failure = Some(now);
        self.failures += 1;
        match state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.success_count = 0;
            }
            CircuitState::Closed if self.failures >= self.threshold => {
                self.state = CircuitState::Open;
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    pub fn is_open(&mut self, now: DateTime<Utc>) -> bool {
        self.evaluate(now) == CircuitState::Open
    }

    /// First instant at which an open breaker moves to half-open.
    ///
    /// `None` unless the breaker is open.
    pub fn half_open_at(&self) -> Option<DateTime<Utc>> {
        if self.state != CircuitState::Open {
            return None;
        }
        let last_failure = self.last_failure?;
        let cool_down = chrono::Duration::milliseconds(self.timeout_ms as i64 + 1);
        last_failure.checked_add_signed(cool_down)
    }
}

/// Store-backed registry of breakers, one per dependency.
///
/// Updates are read-modify-write without a lock; concurrent updates from
/// several workers may lose an increment, which only delays a trip.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn OrderedStore>,
    keys: Keys,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        store: Arc<dyn OrderedStore>,
        keys: Keys,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            clock,
        }
    }

    /// Loads the breaker for `dependency`, creating a closed one if absent.
    async fn load(&self, dependency: &str) -> Result<CircuitBreaker, StoreError> {
        let fresh = || CircuitBreaker::new(dependency, self.config.settings_for(dependency));
        match self.store.get(&self.keys.breaker(dependency)).await? {
            Some(raw) => match serde_json::from_str::<CircuitBreaker>(&raw) {
                Ok(breaker) => Ok(breaker),
                Err(e) => {
                    warn!(dependency = %dependency, error = %e, "Discarding unreadable breaker state");
                    Ok(fresh())
                }
            },
            None => Ok(fresh()),
        }
    }

    async fn save(&self, breaker: &CircuitBreaker) -> Result<(), StoreError> {
        let raw = serde_json::to_string(breaker).map_err(|e| StoreError::UnexpectedReply {
            command: "SET".to_string(),
            detail: format!("breaker state not serializable: {}", e),
        })?;
        self.store
            .set(&self.keys.breaker(&breaker.dependency), &raw)
            .await?;
        self.store
            .sadd(&self.keys.breakers(), &breaker.dependency)
            .await?;
        crate::metrics::MetricsCollector::record_breaker_state(
            &breaker.dependency,
            breaker.state,
        );
        Ok(())
    }

    /// Records a successful call and returns the resulting state.
    pub async fn record_success(&self, dependency: &str) -> Result<CircuitState, StoreError> {
        let mut breaker = self.load(dependency).await?;
        let before = breaker.state;
        breaker.record_success(self.clock.now());
        if before != CircuitState::Closed && breaker.state == CircuitState::Closed {
            info!(dependency = %dependency, "Circuit breaker closed");
        }
        self.save(&breaker).await?;
        Ok(breaker.state)
    }

    /// Records a failed call and returns the resulting state.
    pub async fn record_failure(&self, dependency: &str) -> Result<CircuitState, StoreError> {
        let mut breaker = self.load(dependency).await?;
        let before = breaker.state;
        breaker.record_failure(self.clock.now());
        if before != CircuitState::Open && breaker.state == CircuitState::Open {
            warn!(
                dependency = %dependency,
                failures = breaker.failures,
                "Circuit breaker opened"
            );
        }
        self.save(&breaker).await?;
        Ok(breaker.state)
    }

    /// Returns whether calls to `dependency` should be skipped.
    ///
    /// Persists the open → half-open transition when the cool-down has
    /// elapsed.
    pub async fn is_circuit_open(&self, dependency: &str) -> Result<bool, StoreError> {
        Ok(self.state(dependency).await?.state == CircuitState::Open)
    }

    /// When `dependency`'s breaker is open, the instant it starts probing.
    pub async fn open_until(&self, dependency: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state(dependency).await?.half_open_at())
    }

    /// Current (evaluated) breaker for `dependency`.
    pub async fn state(&self, dependency: &str) -> Result<CircuitBreaker, StoreError> {
        let mut breaker = self.load(dependency).await?;
        let before = breaker.state;
        if breaker.evaluate(self.clock.now()) != before {
            debug!(dependency = %dependency, state = %breaker.state, "Circuit breaker probing");
            self.save(&breaker).await?;
        }
        Ok(breaker)
    }

    /// All known breakers keyed by dependency.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, CircuitBreaker>, StoreError> {
        let mut snapshot = BTreeMap::new();
        for dependency in self.store.smembers(&self.keys.breakers()).await? {
            let breaker = self.state(&dependency).await?;
            snapshot.insert(dependency, breaker);
        }
        Ok(snapshot)
    }
}
