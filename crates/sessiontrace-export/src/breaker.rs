//! Circuit breaker guarding the collector
//!
//! ```text
//!   Closed --(threshold consecutive failures)--> Open
//!   Open   --(cooldown elapsed, next request)--> HalfOpen (one trial)
//!   HalfOpen --trial ok--> Closed
//!   HalfOpen --trial failed--> Open (cooldown restarts)
//!   HalfOpen --trial dropped--> Open (next request is the trial)
//! ```
//!
//! All transitions happen under one mutex, so every caller sees a consistent
//! state. At most one trial permit exists at a time; it is released only by
//! its outcome or by being dropped.

use parking_lot::Mutex;
use sessiontrace_core::config::PipelineSettings;
use sessiontrace_core::metrics::SharedMetrics;
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failed exports that open the breaker
    pub failure_threshold: u32,

    /// Time spent open before a trial is allowed
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&PipelineSettings> for BreakerConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            failure_threshold: settings.breaker_failure_threshold,
            cooldown: settings.breaker_cooldown,
        }
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value of the `circuit_breaker_state` gauge
    pub fn as_gauge(&self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Kind of export a permit allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal export; local retries allowed
    Normal,
    /// The single half-open trial; no retries
    Trial,
}

/// Permission to make one export
///
/// Report the outcome with [`Permit::success`] or [`Permit::failure`]. A
/// trial permit dropped without an outcome (its export was cancelled) sends
/// the breaker back to Open with the trial immediately available again.
#[must_use = "report the export outcome on the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.admission);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.abandon_trial();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

impl Inner {
    fn state(&self) -> CircuitState {
        match self {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Process-wide circuit breaker
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    metrics: SharedMetrics,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, metrics: SharedMetrics) -> Self {
        metrics
            .export
            .circuit_breaker_state
            .store(CircuitState::Closed.as_gauge(), Ordering::Relaxed);
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner::Closed { failures: 0 }),
            metrics,
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state()
    }

    /// Ask to make a request; `None` means short-circuit without a network call
    ///
    /// While a trial permit is alive every other caller gets `None`.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let admission = match *inner {
            Inner::Closed { .. } => Admission::Normal,
            Inner::Open { until } if now >= until => {
                self.transition(&mut inner, Inner::HalfOpen);
                info!("Circuit breaker half-open, sending trial export");
                Admission::Trial
            }
            Inner::Open { .. } | Inner::HalfOpen => return None,
        };
        Some(Permit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (inner.state(), admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.transition(&mut inner, Inner::Closed { failures: 0 });
                info!("Circuit breaker closed, collector reachable again");
            }
            (CircuitState::Closed, _) => *inner = Inner::Closed { failures: 0 },
            // Late result of a request admitted before the breaker opened
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let now = Instant::now();
        let cooldown = self.config.cooldown;
        let mut inner = self.inner.lock();
        match (*inner, admission) {
            (Inner::HalfOpen, Admission::Trial) => {
                self.transition(&mut inner, Inner::Open { until: now + cooldown });
                warn!("Circuit breaker trial failed, reopening for {:?}", cooldown);
            }
            (Inner::Closed { failures }, _) => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(&mut inner, Inner::Open { until: now + cooldown });
                    warn!(
                        "Circuit breaker opened after {} consecutive failed exports, cooling down for {:?}",
                        failures, cooldown
                    );
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            _ => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if let Inner::HalfOpen = *inner {
            self.transition(&mut inner, Inner::Open { until: Instant::now() });
            warn!("Circuit breaker trial abandoned, next export becomes the trial");
        }
    }

    fn transition(&self, inner: &mut Inner, next: Inner) {
        let state = next.state();
        *inner = next;
        self.metrics
            .export
            .circuit_breaker_state
            .store(state.as_gauge(), Ordering::Relaxed);
        self.metrics
            .export
            .circuit_breaker_transitions
            .fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiontrace_core::metrics::create_metrics;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
            create_metrics(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 30);
        for _ in 0..2 {
            breaker.try_acquire().unwrap().failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
        assert_eq!(
            breaker.metrics.export.circuit_breaker_state.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(2, 30);
        breaker.try_acquire().unwrap().failure();
        breaker.try_acquire().unwrap().success();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker(1, 30);
        breaker.try_acquire().unwrap().failure();
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Concurrent requests during the trial are short-circuited
        assert!(breaker.try_acquire().is_none());
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire().unwrap().admission(), Admission::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_trial_blocks_second_trial() {
        let breaker = breaker(1, 1);
        breaker.try_acquire().unwrap().failure();

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);

        // Trial outlives several cooldowns; still the only one
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.try_acquire().is_none());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_next_trial() {
        let breaker = breaker(1, 30);
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::Open);

        // No fresh cooldown after an abandoned trial
        let next = breaker.try_acquire().unwrap();
        assert_eq!(next.admission(), Admission::Trial);
        next.success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Dropping a normal permit changes nothing
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let breaker = breaker(1, 30);
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = breaker.try_acquire().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        trial.failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.try_acquire().unwrap().admission(), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_ignored_while_open() {
        let breaker = breaker(1, 30);
        let early = breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        early.success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker
                .metrics
                .export
                .circuit_breaker_transitions
                .load(Ordering::Relaxed),
            1
        );
    }
}
