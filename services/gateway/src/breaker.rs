//! Circuit breaker guarding the AI backend.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open
//! short-circuits to the fallback text without touching the backend; after
//! `reset_timeout` one probe at a time is allowed (HalfOpen), and
//! `success_threshold` successful probes close the circuit again.  Every
//! underlying call also races an independent hard timeout that counts as a
//! failure.  State sits behind a single mutex.

use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    pub call_timeout: Duration,
    /// Returned verbatim whenever the backend cannot answer.
    pub fallback_text: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(55),
            fallback_text: "Service is temporarily unavailable, please try again shortly."
                .to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probe_in_flight: bool,
}

/// Outcome of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerOutcome {
    Generated(String),
    Fallback(String),
}

impl BreakerOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, BreakerOutcome::Fallback(_))
    }

    pub fn into_text(self) -> String {
        match self {
            BreakerOutcome::Generated(t) | BreakerOutcome::Fallback(t) => t,
        }
    }
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                probe_in_flight: false,
            }),
        }
    }

    /// Run `attempt` under the breaker.  When the circuit is open (or a
    /// half-open probe is already in flight) the backend is not contacted
    /// and the fallback text comes back immediately.
    pub async fn call<F, Fut, E>(&self, attempt: F) -> BreakerOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
        E: Display,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                State::Open { opened_at } => {
                    if opened_at.elapsed() >= self.cfg.reset_timeout {
                        info!("circuit half-open, allowing probe");
                        inner.state = State::HalfOpen;
                        inner.probe_in_flight = true;
                    } else {
                        return BreakerOutcome::Fallback(self.cfg.fallback_text.clone());
                    }
                }
                State::HalfOpen => {
                    if inner.probe_in_flight {
                        return BreakerOutcome::Fallback(self.cfg.fallback_text.clone());
                    }
                    inner.probe_in_flight = true;
                }
                State::Closed => {}
            }
        }

        let result = tokio::time::timeout(self.cfg.call_timeout, attempt()).await;
        match result {
            Ok(Ok(text)) => {
                self.record_success();
                BreakerOutcome::Generated(text)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "guarded call failed");
                self.record_failure();
                BreakerOutcome::Fallback(self.cfg.fallback_text.clone())
            }
            Err(_) => {
                warn!(timeout_ms = self.cfg.call_timeout.as_millis() as u64, "guarded call timed out");
                self.record_failure();
                BreakerOutcome::Fallback(self.cfg.fallback_text.clone())
            }
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.inner.lock().unwrap().state {
            State::Closed => "closed",
            State::Open { .. } => "open",
            State::HalfOpen => "half-open",
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    info!("circuit closed");
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                }
            }
            State::Closed | State::Open { .. } => {
                inner.consecutive_failures = 0;
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::HalfOpen => {
                warn!("probe failed, circuit re-opened");
                inner.probe_in_flight = false;
                inner.consecutive_successes = 0;
                inner.state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    inner.state = State::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            State::Open { .. } => {}
        }
    }
}
