//! Convergence Poller
//!
//! Blocks until a remotely provisioned object reaches a target state. Each
//! tick performs exactly one read through a caller-supplied `fetch` closure and
//! classifies the returned label against a closed alphabet:
//!
//! - the target label ends the wait successfully
//! - a transient label schedules another tick after a bounded backoff
//! - anything else is an unexpected state and ends the wait
//!
//! Not-found reads are tolerated up to a budget, which models the lag between
//! creating an object and it becoming readable.

use crate::cancel::CancelToken;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of one successful poll
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<T> {
    pub state: String,
    pub payload: T,
}

impl<T> Observation<T> {
    pub fn new(state: impl Into<String>, payload: T) -> Self {
        Self {
            state: state.into(),
            payload,
        }
    }
}

/// Errors returned by a `fetch` closure
pub trait RemoteError: std::error::Error + 'static {
    /// Whether the read failed because the object does not exist (yet)
    fn is_not_found(&self) -> bool;
}

/// Why a wait ended without reaching the target
#[derive(Error, Debug)]
pub enum ConvergenceError<E: std::error::Error + 'static> {
    #[error("transport error: {0}")]
    Transport(#[source] E),
    #[error("resource not found after {attempts} attempts")]
    NotFound { attempts: u32 },
    #[error("unexpected state '{state}', wanted '{target}'")]
    UnexpectedState { state: String, target: String },
    #[error("timeout after {elapsed:?} waiting for state '{target}' (last state: {})", .last_state.as_deref().unwrap_or("none"))]
    Timeout {
        target: String,
        elapsed: Duration,
        last_state: Option<String>,
    },
    #[error("cancelled while waiting for state '{target}'")]
    Cancelled { target: String },
}

impl<E: std::error::Error + 'static> ConvergenceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConvergenceError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConvergenceError::Cancelled { .. })
    }
}

/// Rejected [`PollSpec`] parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidPollSpec {
    #[error("target state must not be empty")]
    EmptyTarget,
    #[error("target state '{0}' is also listed as transient")]
    TargetIsTransient(String),
    #[error("minimum interval must be greater than zero")]
    ZeroMinInterval,
    #[error("minimum interval {min:?} exceeds maximum interval {max:?}")]
    IntervalOrder { min: Duration, max: Duration },
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// Parameters for one convergence wait
///
/// Only constructible through [`PollSpec::builder`], so a `PollSpec` always
/// satisfies its invariants.
#[derive(Debug, Clone)]
pub struct PollSpec {
    target: String,
    transient_states: HashSet<String>,
    poll_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    timeout: Duration,
    not_found_retry_budget: u32,
}

impl PollSpec {
    pub fn builder(target: impl Into<String>) -> PollSpecBuilder {
        PollSpecBuilder {
            target: target.into(),
            transient_states: HashSet::new(),
            poll_interval: Duration::ZERO,
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60 * 60),
            not_found_retry_budget: 0,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_transient(&self, state: &str) -> bool {
        self.transient_states.contains(state)
    }

    /// Delay before the first fetch
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn not_found_retry_budget(&self) -> u32 {
        self.not_found_retry_budget
    }

    /// A fresh backoff sequence for this spec
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_interval, self.max_interval)
    }
}

/// Builder for [`PollSpec`]
#[derive(Debug, Clone)]
pub struct PollSpecBuilder {
    target: String,
    transient_states: HashSet<String>,
    poll_interval: Duration,
    min_interval: Duration,
    max_interval: Duration,
    timeout: Duration,
    not_found_retry_budget: u32,
}

impl PollSpecBuilder {
    pub fn transient<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transient_states
            .extend(states.into_iter().map(Into::into));
        self
    }

    pub fn poll_interval(mut self, delay: Duration) -> Self {
        self.poll_interval = delay;
        self
    }

    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn not_found_retry_budget(mut self, budget: u32) -> Self {
        self.not_found_retry_budget = budget;
        self
    }

    pub fn build(self) -> Result<PollSpec, InvalidPollSpec> {
        if self.target.is_empty() {
            return Err(InvalidPollSpec::EmptyTarget);
        }
        if self.transient_states.contains(&self.target) {
            return Err(InvalidPollSpec::TargetIsTransient(self.target));
        }
        if self.min_interval.is_zero() {
            return Err(InvalidPollSpec::ZeroMinInterval);
        }
        if self.min_interval > self.max_interval {
            return Err(InvalidPollSpec::IntervalOrder {
                min: self.min_interval,
                max: self.max_interval,
            });
        }
        if self.timeout.is_zero() {
            return Err(InvalidPollSpec::ZeroTimeout);
        }

        Ok(PollSpec {
            target: self.target,
            transient_states: self.transient_states,
            poll_interval: self.poll_interval,
            min_interval: self.min_interval,
            max_interval: self.max_interval,
            timeout: self.timeout,
            not_found_retry_budget: self.not_found_retry_budget,
        })
    }
}

/// Doubling backoff capped at a maximum
///
/// Sequence for min=5s, max=10s: 5s, 10s, 10s, ...
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            current: min.min(max),
            max,
        }
    }

    /// Get the next wait and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }
}

/// Where an observed label puts the poll state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Transient label, keep polling
    Pending,
    Target,
    /// Label outside the known alphabet
    Unexpected,
}

impl PollSpec {
    /// Classify an observed label
    pub fn classify(&self, state: &str) -> PollState {
        if state == self.target {
            PollState::Target
        } else if self.is_transient(state) {
            PollState::Pending
        } else {
            PollState::Unexpected
        }
    }
}

/// Poll `fetch` until it reports `spec.target()`
///
/// Cancellation is checked before every fetch and interrupts both sleeps and
/// in-flight fetches. No fetch starts at or after the deadline.
pub async fn converge<T, E, F, Fut>(
    cancel: &CancelToken,
    spec: &PollSpec,
    mut fetch: F,
) -> Result<Observation<T>, ConvergenceError<E>>
where
    E: RemoteError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<T>, E>>,
{
    let started = Instant::now();
    let deadline = instant_after(started, spec.timeout);
    let mut backoff = spec.backoff();
    let mut attempts: u32 = 0;
    let mut not_found_streak: u32 = 0;
    let mut last_state: Option<String> = None;

    let timed_out = |last_state: Option<String>| ConvergenceError::Timeout {
        target: spec.target.clone(),
        elapsed: started.elapsed(),
        last_state,
    };
    let cancelled = || ConvergenceError::Cancelled {
        target: spec.target.clone(),
    };

    if !spec.poll_interval.is_zero() && !pause(cancel, spec.poll_interval, deadline).await {
        return Err(cancelled());
    }

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        if Instant::now() >= deadline {
            warn!(target_state = %spec.target, attempts, "Timed out waiting for state");
            return Err(timed_out(last_state));
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            outcome = tokio::time::timeout_at(deadline, fetch()) => outcome,
        };
        let Ok(outcome) = outcome else {
            warn!(target_state = %spec.target, attempts, "Timed out during fetch");
            return Err(timed_out(last_state));
        };

        match outcome {
            Ok(observation) => match spec.classify(&observation.state) {
                PollState::Target => {
                    info!(state = %observation.state, attempts, "Reached target state");
                    return Ok(observation);
                }
                PollState::Pending => {
                    debug!(state = %observation.state, attempts, "Still converging");
                    not_found_streak = 0;
                    last_state = Some(observation.state);
                }
                PollState::Unexpected => {
                    return Err(ConvergenceError::UnexpectedState {
                        state: observation.state,
                        target: spec.target.clone(),
                    });
                }
            },
            Err(e) if e.is_not_found() => {
                not_found_streak += 1;
                if not_found_streak > spec.not_found_retry_budget {
                    warn!(attempts, error = %e, "Resource still not found, giving up");
                    return Err(ConvergenceError::NotFound { attempts });
                }
                warn!(
                    attempts,
                    error = %e,
                    remaining = spec.not_found_retry_budget - not_found_streak,
                    "Resource not found yet"
                );
            }
            Err(e) => return Err(ConvergenceError::Transport(e)),
        }

        if !pause(cancel, backoff.next_backoff(), deadline).await {
            return Err(cancelled());
        }
    }
}

/// Stand-in for instants past what the clock can represent
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `base + delay`, saturating to a far-future instant instead of overflowing
fn instant_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay.min(FAR_FUTURE)).unwrap_or(base)
}

/// Sleep for `wait` without passing `deadline`. Returns false if cancelled.
async fn pause(cancel: &CancelToken, wait: Duration, deadline: Instant) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    let wake = instant_after(Instant::now(), wait).min(deadline);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(wake) => true,
    }
}
