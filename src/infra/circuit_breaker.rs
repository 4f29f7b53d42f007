//! Circuit breaker for notification endpoints
//!
//! One breaker per webhook URL so a dead endpoint fails fast instead of
//! holding the outbound queue.
//!
//! # States
//!
//! - **Closed**: requests pass through
//! - **Open**: requests fail fast until the backoff elapses
//! - **HalfOpen**: a limited number of probe requests decide recovery

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` before opening
    pub failure_threshold: u32,
    /// Successes in half-open state before closing
    pub success_threshold: u32,
    /// Time spent open before the first probe
    pub open_timeout: Duration,
    pub failure_window: Duration,
    pub half_open_max_requests: u32,
    /// Growth of the open timeout on consecutive opens
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
            half_open_max_requests: 1,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Default)]
pub struct CircuitBreakerStats {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    /// Calls rejected while open
    pub rejected: AtomicU64,
    pub times_opened: AtomicU64,
}

impl CircuitBreakerStats {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "successes": self.successes.load(Ordering::Relaxed),
            "failures": self.failures.load(Ordering::Relaxed),
            "rejected": self.rejected.load(Ordering::Relaxed),
            "times_opened": self.times_opened.load(Ordering::Relaxed),
        })
    }
}

struct InternalState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_requests: u32,
    consecutive_opens: u32,
    current_backoff: Duration,
}

impl InternalState {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            half_open_requests: 0,
            consecutive_opens: 0,
            current_backoff: config.open_timeout,
        }
    }
}

/// Circuit breaker protecting one external endpoint
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
    stats: CircuitBreakerStats,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(InternalState::new(&config)),
            config,
            stats: CircuitBreakerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        let mut state = self.state.write().await;
        self.maybe_half_open(&mut state);
        state.state
    }

    /// Whether a request may go out now
    pub async fn is_allowed(&self) -> bool {
        let mut state = self.state.write().await;
        self.maybe_half_open(&mut state);

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            CircuitState::HalfOpen => {
                if state.half_open_requests < self.config.half_open_max_requests {
                    state.half_open_requests += 1;
                    true
                } else {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        self.stats.successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                // Let the next probe through
                state.half_open_requests = state.half_open_requests.saturating_sub(1);
                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write().await;
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => {
                if let Some(last) = state.last_failure_time {
                    if now.duration_since(last) > self.config.failure_window {
                        state.failure_count = 0;
                    }
                }
                state.failure_count += 1;
                state.last_failure_time = Some(now);
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                state.last_failure_time = Some(now);
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {
                state.last_failure_time = Some(now);
            }
        }
    }

    /// Run a call under the breaker
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.is_allowed().await {
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match f.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::ServiceError(e))
            }
        }
    }

    pub fn stats(&self) -> &CircuitBreakerStats {
        &self.stats
    }

    pub async fn current_backoff(&self) -> Duration {
        self.state.read().await.current_backoff
    }

    fn maybe_half_open(&self, state: &mut InternalState) {
        if state.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() >= state.current_backoff {
                tracing::info!(circuit = %self.name, "Circuit breaker half-open");
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                state.half_open_requests = 0;
            }
        }
    }

    fn transition_to_open(&self, state: &mut InternalState) {
        state.consecutive_opens += 1;

        let exponent = state.consecutive_opens.saturating_sub(1) as i32;
        let backoff = self.config.open_timeout.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        state.current_backoff =
            Duration::from_secs_f64(backoff.min(self.config.max_backoff.as_secs_f64()));

        tracing::warn!(
            circuit = %self.name,
            failures = state.failure_count,
            consecutive_opens = state.consecutive_opens,
            backoff = ?state.current_backoff,
            "Circuit breaker opened"
        );

        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        state.half_open_requests = 0;
        self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn transition_to_closed(&self, state: &mut InternalState) {
        tracing::info!(circuit = %self.name, "Circuit breaker closed");

        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
        state.half_open_requests = 0;
        state.consecutive_opens = 0;
        state.current_backoff = self.config.open_timeout;
    }
}

/// Error of a breaker-protected call
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    ServiceError(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::CircuitOpen => write!(f, "circuit breaker is open"),
            CircuitBreakerError::ServiceError(e) => write!(f, "service error: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::CircuitOpen => None,
            CircuitBreakerError::ServiceError(e) => Some(e),
        }
    }
}

// ============================================================================
// Circuit Breaker Registry
// ============================================================================

/// Breakers keyed by endpoint
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(name) {
                return cb.clone();
            }
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_config(name, self.config.clone())))
            .clone()
    }

    /// State and stats of every breaker
    pub async fn status(&self) -> serde_json::Value {
        let breakers = self.breakers.read().await;
        let mut status = serde_json::Map::new();

        for (name, cb) in breakers.iter() {
            status.insert(
                name.clone(),
                serde_json::json!({
                    "state": cb.state().await.to_string(),
                    "stats": cb.stats().to_json(),
                }),
            );
        }

        serde_json::Value::Object(status)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
