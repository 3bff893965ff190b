//! Retry policy with exponential backoff, jitter and per-error recovery.
//!
//! [`RetryPolicy::execute`] drives a [`RetryTarget`]: it runs attempts,
//! asks the policy's classifier which recovery the failure calls for,
//! performs it, backs off, and finally reports a tagged [`RetryOutcome`]
//! instead of raising.

use crate::clock::Clock;
use crate::config::BackoffConfig;
use crate::error::{HarvestError, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

/// What to do between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// Give up immediately.
    Abort,
    /// Back off and try again as is.
    Backoff,
    /// Dismiss dialogs and reload the page, then back off.
    ReloadPage,
    /// Tear down the browser and launch a new one, then back off.
    RotateSession,
}

impl Recovery {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Backoff => "backoff",
            Self::ReloadPage => "reload_page",
            Self::RotateSession => "rotate_session",
        }
    }
}

/// Maps a failure and the attempt that produced it to a recovery.
pub type Classifier = fn(&HarvestError, u32) -> Recovery;

/// Connection-class failures escalate to a fresh session from the second
/// failed attempt on; element and other browser failures only reload.
pub fn default_classifier(err: &HarvestError, attempt: u32) -> Recovery {
    if err.is_terminal() {
        Recovery::Abort
    } else if err.is_connection_class() {
        if attempt >= 2 {
            Recovery::RotateSession
        } else {
            Recovery::ReloadPage
        }
    } else {
        Recovery::ReloadPage
    }
}

/// One retried operation.
#[async_trait]
pub trait RetryTarget<T: Send>: Send {
    async fn attempt(&mut self, attempt: u32) -> Result<T>;
    async fn recover(&mut self, recovery: Recovery, attempt: u32) -> Result<()>;
    /// Observe a failed attempt before recovery runs.
    fn on_failure(&mut self, _err: &HarvestError, _attempt: u32, _recovery: Recovery) {}
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    Exhausted { error: HarvestError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Exhausted { error, .. } => Err(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub cap: Duration,
    /// Jitter upper bound as a fraction of the un-jittered delay.
    pub jitter: f64,
    pub classify: Classifier,
}

impl RetryPolicy {
    pub fn new(backoff: &BackoffConfig) -> Self {
        Self {
            max_attempts: backoff.max_attempts.max(1),
            initial: backoff.initial,
            cap: backoff.cap,
            jitter: backoff.jitter.max(0.0),
            classify: default_classifier,
        }
    }

    pub fn with_classifier(mut self, classify: Classifier) -> Self {
        self.classify = classify;
        self
    }

    /// `initial * 2^(attempt-1)`, before the cap.
    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor)
    }

    /// `min(initial * 2^(attempt-1), cap)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.exponential(attempt).min(self.cap)
    }

    /// Largest delay `delay_for(attempt)` can return.
    pub fn max_delay(&self, attempt: u32) -> Duration {
        let base = self.exponential(attempt);
        base.saturating_add(base.mul_f64(self.jitter)).min(self.cap)
    }

    /// `min(initial * 2^(attempt-1) + jitter, cap)` with jitter drawn from
    /// `[0, jitter * initial * 2^(attempt-1)]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.exponential(attempt);
        let jitter = if self.jitter > 0.0 {
            base.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter))
        } else {
            Duration::ZERO
        };
        base.saturating_add(jitter).min(self.cap)
    }

    pub async fn execute<T, R>(&self, clock: &dyn Clock, target: &mut R) -> RetryOutcome<T>
    where
        T: Send,
        R: RetryTarget<T> + ?Sized,
    {
        let mut attempt = 1;
        loop {
            let err = match target.attempt(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(err) => err,
            };

            let recovery = (self.classify)(&err, attempt);
            target.on_failure(&err, attempt, recovery);
            if recovery == Recovery::Abort || attempt >= self.max_attempts {
                return RetryOutcome::Exhausted {
                    error: err,
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            warn!(
                "attempt {attempt}/{} failed ({}): {err}; {} then retry in {:.1}s",
                self.max_attempts,
                err.kind(),
                recovery.as_str(),
                delay.as_secs_f64()
            );
            if let Err(e) = target.recover(recovery, attempt).await {
                warn!("recovery {} failed: {e}", recovery.as_str());
            }
            clock.sleep(delay).await;
            attempt += 1;
        }
    }
}
