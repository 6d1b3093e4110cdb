//! Per-provider circuit breakers.
//!
//! A [`CircuitBreaker`] counts consecutive failures for one provider and opens
//! once the count reaches its threshold. While open, [`CircuitBreaker::can_attempt`]
//! refuses until the cooldown has elapsed since the last failure; the first call
//! after that closes the circuit again and lets the caller's own request act as
//! the trial. A failed trial re-opens the circuit immediately because the
//! failure count is left untouched until a success.
//!
//! Breakers live in a [`BreakerRegistry`] keyed by provider id. The registry is
//! an ordinary value so tests can build isolated instances with a
//! [`ManualClock`].

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of consecutive failures that opens a circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit refuses attempts.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Source of monotonic time for breakers.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// The real monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Breaker
// ─────────────────────────────────────────────────────────────────────────────

/// Threshold and cooldown for a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl BreakerConfig {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
        }
    }
}

/// Failure-tracking state for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderState {
    pub consecutive_failures: u32,
    pub last_failure_time: Option<Instant>,
    pub open: bool,
    pub threshold: u32,
    pub cooldown: Duration,
}

impl ProviderState {
    fn new(config: BreakerConfig) -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
            open: false,
            threshold: config.threshold,
            cooldown: config.cooldown,
        }
    }
}

/// Circuit breaker for a single provider. Never fails; only gates.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    state: Mutex<ProviderState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker using the system clock.
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    /// Create a breaker with an explicit clock.
    pub fn with_clock(
        provider: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider: provider.into(),
            state: Mutex::new(ProviderState::new(config)),
            clock,
        }
    }

    /// Provider id this breaker guards.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Reset the failure count and close the circuit.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.open || state.consecutive_failures > 0 {
            tracing::debug!(provider = %self.provider, "Circuit breaker reset after success");
        }
        state.consecutive_failures = 0;
        state.open = false;
    }

    /// Count a failure, opening the circuit once the threshold is reached.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_time = Some(now);

        if !state.open && state.consecutive_failures >= state.threshold {
            state.open = true;
            tracing::warn!(
                provider = %self.provider,
                failures = state.consecutive_failures,
                cooldown_secs = state.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Whether a request may be sent to this provider now.
    ///
    /// An open circuit whose cooldown has elapsed is closed by this call, so
    /// the request the caller is about to make is the trial.
    pub fn can_attempt(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.open {
            return true;
        }

        let elapsed = state
            .last_failure_time
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);

        if elapsed >= state.cooldown {
            state.open = false;
            tracing::info!(
                provider = %self.provider,
                elapsed_secs = elapsed.as_secs(),
                "Circuit breaker cooldown elapsed, allowing trial request"
            );
            true
        } else {
            false
        }
    }

    /// Whether the circuit is currently open. Has no side effects.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ProviderState {
        self.state.lock().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Provider id → breaker map, shared by every conversation in the process.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerRegistry {
    /// Create a registry whose breakers use the system clock.
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a registry whose breakers share the given clock.
    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Get the breaker for a provider, creating it on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(
                    provider,
                    self.config,
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }

    /// Provider ids that have a breaker.
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.breakers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
