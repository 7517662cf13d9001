use std::fmt::Debug;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::error::ResourceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// `delay * 2^attempt`, with `attempt` starting at 1.
    Exponential,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(attempts: usize, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub const fn exponential(attempts: usize, base: Duration) -> Self {
        Self {
            attempts,
            delay: base,
            backoff: Backoff::Exponential,
        }
    }

    pub const fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Pause after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor)
            }
        }
    }
}

/// Runs `op` until it succeeds or the policy is exhausted. `op` receives the
/// 1-based attempt number.
pub fn retry<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, ResourceError>
where
    F: FnMut(usize) -> Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut failures = Vec::new();
    for attempt in 1..=attempts {
        match op(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{what} succeeded on attempt {attempt}");
                }
                return Ok(value);
            }
            Err(err) => {
                log::warn!("{what} attempt {attempt}/{attempts} failed: {err:?}");
                failures.push(format!("{err:#}"));
                if attempt < attempts {
                    let pause = policy.delay_after(attempt);
                    if !pause.is_zero() {
                        thread::sleep(pause);
                    }
                }
            }
        }
    }
    log::error!("{what} failed after {attempts} attempts");
    Err(exhausted(what, failures))
}

/// Tries each candidate in order and returns the first one that loads.
pub fn first_success<C, T, F>(candidates: &[C], what: &str, mut load: F) -> Result<(T, C), ResourceError>
where
    C: Clone + Debug,
    F: FnMut(&C) -> Result<T>,
{
    if candidates.is_empty() {
        return Err(ResourceError::NoCandidates {
            what: what.to_string(),
        });
    }
    let mut failures = Vec::new();
    for candidate in candidates {
        match load(candidate) {
            Ok(value) => {
                log::info!("{what}: using {candidate:?}");
                return Ok((value, candidate.clone()));
            }
            Err(err) => {
                log::warn!("{what}: {candidate:?} rejected: {err:?}");
                failures.push(format!("{candidate:?}: {err:#}"));
            }
        }
    }
    Err(exhausted(what, failures))
}

fn exhausted(what: &str, failures: Vec<String>) -> ResourceError {
    ResourceError::Exhausted {
        what: what.to_string(),
        attempts: failures.len(),
        last: failures.last().cloned().unwrap_or_default(),
        failures,
    }
}
