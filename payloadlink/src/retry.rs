//! Bounded retry with exponential back-off and cancellation.
//!
//! Every "keep trying" loop in this crate (per-file downloads, channel
//! reconnects) goes through [`RetryPolicy::run`], so each one has an attempt
//! budget, an optional overall timeout and a cancellation point.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of cancellation checks while sleeping between attempts.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared cancellation flag.
///
/// Clones observe the same flag. A token also reports cancelled when the
/// embedding application's interrupt checker fires
/// (see [`crate::set_interrupt_checker`]).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested on this token or globally.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || crate::is_interrupted_requested()
    }

    /// Return `Err(Error::Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// Retry policy: attempt budget, back-off curve and overall timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between a fixed number of attempts.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            timeout: None,
        }
    }

    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the overall timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds, fails permanently or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number. Non-transient errors are
    /// returned as-is; an exhausted budget or timeout yields
    /// [`Error::RetriesExhausted`] carrying the last error.
    pub fn run<T, F>(&self, cancel: &CancelToken, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let start = Instant::now();
        let max = self.attempts();

        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;

            let err = match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{what} succeeded on attempt {attempt}/{max}");
                    }
                    return Ok(value);
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            let timed_out = self.timeout.is_some_and(|limit| start.elapsed() >= limit);
            if attempt >= max || timed_out {
                return Err(Error::RetriesExhausted {
                    what: what.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt);
            warn!("{what} failed (attempt {attempt}/{max}): {err}; retrying in {delay:?}");
            cancel.sleep(delay)?;
        }
    }
}
