//! Retry scheduling as an explicit state machine.
//!
//! The schedule is pure data: callers ask for the next delay and decide
//! whether to sleep, which keeps the sequence assertable in tests without a
//! clock.

use std::time::Duration;

use rand::Rng;

use crate::config::UpstreamSettings;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

impl From<&UpstreamSettings> for RetryPolicy {
    fn from(settings: &UpstreamSettings) -> Self {
        RetryPolicy::new(
            settings.max_retries,
            settings.backoff_base,
            settings.backoff_cap,
        )
    }
}

/// Per-request retry state: how many retries have been scheduled and what the
/// next delay will be.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries_scheduled: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries_scheduled: 0,
        }
    }

    pub fn retries_scheduled(&self) -> u32 {
        self.retries_scheduled
    }

    /// Next delay in the schedule, or `None` once the retry budget is spent.
    /// Delays double from the base up to the cap; optional jitter adds up to
    /// half of the undithered step, which keeps the sequence non-decreasing.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_scheduled >= self.policy.max_retries {
            return None;
        }

        let step = exponential_step(
            self.policy.base_delay,
            self.retries_scheduled,
            self.policy.max_delay,
        );
        self.retries_scheduled += 1;

        if !self.policy.jitter {
            return Some(step);
        }

        let spread = step / 2;
        let jitter = if spread.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..=spread.as_nanos() as u64))
        };
        Some(step.saturating_add(jitter).min(self.policy.max_delay))
    }
}

fn exponential_step(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}
