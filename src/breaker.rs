// src/breaker.rs
//! Per-endpoint circuit breakers.
//!
//! ```text
//! CLOSED    --failure_count >= failure_threshold-->  OPEN
//! OPEN      --now >= next_attempt, next call------>  HALF_OPEN
//! HALF_OPEN --success_threshold successes--------->  CLOSED
//! HALF_OPEN --any failure------------------------->  OPEN (longer backoff)
//! ```
//!
//! HALF_OPEN admits one trial call at a time; callers arriving while the
//! trial runs are rejected as if the circuit were still open.
//!
//! The registry is shared by every fetch that names the same endpoint, so
//! concurrent logical fetches against one endpoint share one failure count.
//! State lives for the registry's lifetime only (process or session).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    /// Quiet period after which a success clears stale failures in CLOSED.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            base_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(5 * 60),
            reset_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl BreakerConfig {
    /// `min(base * 2^max(0, consecutive - threshold), max)`
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures
            .saturating_sub(self.failure_threshold)
            .min(20);
        self.base_timeout
            .saturating_mul(1u32 << exp)
            .min(self.max_timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_failures: u32,
    pub success_count: u32,
    pub next_attempt: Option<Instant>,
}

#[derive(Debug)]
struct Breaker {
    cfg: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    consecutive_failures: u32,
    success_count: u32,
    next_attempt: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_failures: 0,
            success_count: 0,
            next_attempt: None,
            last_failure: None,
            trial_in_flight: false,
        }
    }

    fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            success_count: self.success_count,
            next_attempt: self.next_attempt,
        }
    }

    /// Gate a call. `Ok(true)` marks the caller as the HALF_OPEN trial;
    /// `Err` carries the remaining wait when the circuit rejects it.
    fn admit(&mut self, now: Instant) -> Result<bool, Duration> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if self.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::Open => match self.next_attempt {
                Some(at) if now < at => Err(at - now),
                _ => {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    self.trial_in_flight = true;
                    Ok(true)
                }
            },
        }
    }

    /// Returns true when this success closed the circuit.
    fn on_success(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.cfg.success_threshold {
                    self.close();
                    return true;
                }
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                let healed = self
                    .last_failure
                    .is_some_and(|t| now.saturating_duration_since(t) >= self.cfg.reset_timeout);
                if healed {
                    self.failure_count = 0;
                    self.last_failure = None;
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitState::Open => {}
        }
        false
    }

    /// Returns true when this failure (re)opened the circuit.
    fn on_failure(&mut self, now: Instant) -> bool {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.success_count = 0;
        self.last_failure = Some(now);

        let trip = match self.state {
            CircuitState::HalfOpen | CircuitState::Open => true,
            CircuitState::Closed => self.failure_count >= self.cfg.failure_threshold,
        };
        if trip {
            self.state = CircuitState::Open;
            self.next_attempt = Some(now + self.cfg.backoff(self.consecutive_failures));
        }
        trip
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.consecutive_failures = 0;
        self.success_count = 0;
        self.next_attempt = None;
        self.last_failure = None;
    }
}

/// Releases the HALF_OPEN trial slot however the trial ends, including
/// when the caller drops the `execute` future mid-flight.
struct TrialSlot<'a> {
    breakers: &'a Mutex<HashMap<String, Breaker>>,
    name: &'a str,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(b) = self.breakers.lock().get_mut(self.name) {
            b.trial_in_flight = false;
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Per-endpoint thresholds; applies to breakers created after this call.
    pub fn with_override(mut self, name: &str, cfg: BreakerConfig) -> Self {
        self.overrides.insert(name.to_string(), cfg);
        self
    }

    fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Run `op` under the breaker for `name`.
    ///
    /// While OPEN and before `next_attempt`, `op` is not invoked and
    /// `FetchError::CircuitOpen` is returned, as it is for every caller but
    /// one while HALF_OPEN. Cancellations pass through without touching the
    /// counters.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let admitted = {
            let mut map = self.breakers.lock();
            let b = map
                .entry(name.to_string())
                .or_insert_with(|| Breaker::new(self.config_for(name)));
            b.admit(Instant::now())
        };
        let is_trial = match admitted {
            Ok(is_trial) => is_trial,
            Err(wait) => {
                counter!("breaker_rejected_total").increment(1);
                debug!(endpoint = name, retry_in_ms = wait.as_millis() as u64, "circuit open, call skipped");
                return Err(FetchError::CircuitOpen {
                    endpoint: name.to_string(),
                    retry_in_ms: wait.as_millis() as u64,
                });
            }
        };
        let mut slot = TrialSlot {
            breakers: &self.breakers,
            name,
            armed: is_trial,
        };

        let out = op().await;

        // The slot is released under the same lock as the accounting so no
        // second trial slips in before this outcome lands.
        slot.armed = false;
        let now = Instant::now();
        let mut map = self.breakers.lock();
        let Some(b) = map.get_mut(name) else {
            // reset() raced with the call; nothing to account against.
            return out;
        };
        if is_trial {
            b.trial_in_flight = false;
        }
        match &out {
            Ok(_) => {
                if b.on_success(now) {
                    info!(endpoint = name, "circuit closed");
                }
            }
            Err(e) if e.counts_as_failure() => {
                if b.on_failure(now) {
                    counter!("breaker_open_total").increment(1);
                    warn!(
                        endpoint = name,
                        failures = b.failure_count,
                        consecutive = b.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            Err(_) => {}
        }
        out
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(name)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers.lock().get(name).map(Breaker::snapshot)
    }

    pub fn reset(&self, name: &str) {
        self.breakers.lock().remove(name);
    }

    pub fn reset_all(&self) {
        self.breakers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            base_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(300),
        }
    }

    async fn fail(reg: &CircuitBreakerRegistry, name: &str) -> Result<(), FetchError> {
        reg.execute(name, || async { Err::<(), _>(FetchError::Network("boom".into())) })
            .await
    }

    async fn succeed(reg: &CircuitBreakerRegistry, name: &str) -> Result<(), FetchError> {
        reg.execute(name, || async { Ok(()) }).await
    }

    #[test]
    fn backoff_grows_and_caps() {
        let c = fast_cfg();
        assert_eq!(c.backoff(3), Duration::from_secs(10));
        assert_eq!(c.backoff(4), Duration::from_secs(20));
        assert_eq!(c.backoff(5), Duration::from_secs(40));
        assert_eq!(c.backoff(6), Duration::from_secs(60));
        assert_eq!(c.backoff(60), Duration::from_secs(60));
        assert_eq!(c.backoff(0), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_with_longer_backoff() {
        let reg = CircuitBreakerRegistry::new(fast_cfg());
        for _ in 0..3 {
            let _ = fail(&reg, "x").await;
        }
        let first = reg.snapshot("x").unwrap();
        assert_eq!(first.state, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&reg, "x").await;
        let second = reg.snapshot("x").unwrap();
        assert_eq!(second.state, CircuitState::Open);
        let now = Instant::now();
        let wait = second.next_attempt.unwrap() - now;
        assert_eq!(wait, Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let reg = CircuitBreakerRegistry::new(fast_cfg());
        for _ in 0..3 {
            let _ = fail(&reg, "t").await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(reg.breakers.lock().get_mut("t").unwrap().admit(Instant::now()), Ok(true));
        assert_eq!(reg.state("t"), CircuitState::HalfOpen);
        let second = reg.breakers.lock().get_mut("t").unwrap().admit(Instant::now());
        assert_eq!(second, Err(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_failures_heal_after_quiet_period() {
        let reg = CircuitBreakerRegistry::new(fast_cfg());
        let _ = fail(&reg, "y").await;
        let _ = fail(&reg, "y").await;
        succeed(&reg, "y").await.unwrap();
        assert_eq!(reg.snapshot("y").unwrap().failure_count, 2);

        tokio::time::advance(Duration::from_secs(301)).await;
        succeed(&reg, "y").await.unwrap();
        assert_eq!(reg.snapshot("y").unwrap().failure_count, 0);

        // One more blip must not open the circuit.
        let _ = fail(&reg, "y").await;
        assert_eq!(reg.state("y"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn overrides_apply_per_endpoint() {
        let strict = BreakerConfig {
            failure_threshold: 1,
            ..fast_cfg()
        };
        let reg = CircuitBreakerRegistry::new(fast_cfg()).with_override("fragile", strict);
        let _ = fail(&reg, "fragile").await;
        let _ = fail(&reg, "sturdy").await;
        assert_eq!(reg.state("fragile"), CircuitState::Open);
        assert_eq!(reg.state("sturdy"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forgets_endpoint() {
        let reg = CircuitBreakerRegistry::new(fast_cfg());
        for _ in 0..3 {
            let _ = fail(&reg, "z").await;
        }
        assert_eq!(reg.state("z"), CircuitState::Open);
        reg.reset("z");
        assert_eq!(reg.state("z"), CircuitState::Closed);
        assert!(reg.snapshot("z").is_none());

        let calls = AtomicUsize::new(0);
        reg.execute("z", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
