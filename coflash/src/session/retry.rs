//! Polling and retry policies.

use log::trace;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed(Duration),
    /// Delay doubling from `initial` up to `max`.
    Exponential {
        /// Delay after the first attempt.
        initial: Duration,
        /// Upper bound of the delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after the given 1-based attempt failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let shift = attempt
                    .saturating_sub(1)
                    .min(31);
                initial
                    .checked_mul(1 << shift)
                    .map_or(max, |delay| delay.min(max))
            },
        }
    }
}

/// A bounded policy ran out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gave up after {attempts} attempts")]
pub struct Exhausted {
    /// Number of attempts made.
    pub attempts: u32,
}

/// How often and how long to repeat an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Delay schedule.
    pub backoff: Backoff,
    /// Attempt limit; `None` repeats forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Unbounded policy with a fixed interval.
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(interval),
            max_attempts: None,
        }
    }

    /// Unbounded policy with an exponential backoff.
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential { initial, max },
            max_attempts: None,
        }
    }

    /// Limit the number of attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether the policy never gives up.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts
            .is_none()
    }

    /// Repeat `op` until it yields a value.
    ///
    /// `op` receives the 1-based attempt number. Returns the value and the
    /// number of attempts it took.
    pub fn poll<T, F>(&self, mut op: F) -> Result<(T, u32), Exhausted>
    where
        F: FnMut(u32) -> Option<T>,
    {
        let mut attempt: u32 = 1;
        loop {
            if let Some(value) = op(attempt) {
                return Ok((value, attempt));
            }

            if self
                .max_attempts
                .is_some_and(|max| attempt >= max)
            {
                return Err(Exhausted { attempts: attempt });
            }

            let delay = self
                .backoff
                .delay(attempt);
            if !delay.is_zero() {
                trace!("Attempt {attempt} failed, retrying in {} ms", delay.as_millis());
                thread::sleep(delay);
            }
            attempt = attempt.saturating_add(1);
        }
    }
}
