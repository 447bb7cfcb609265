//! Retry scheduling
//!
//! Decides what happens to a target after an attempt and computes the
//! exponential backoff before the next one:
//!
//! ```text
//! backoff(n) = min(base * 2^(n-1), cap) + uniform(0..=jitter)
//! ```
//!
//! With the defaults (base 60s, cap 6h, jitter 30s) attempt 1 waits 60-90s,
//! attempt 3 waits 240-270s and anything from attempt 10 on waits 6h-6h30s.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

use crate::config::DispatchConfig;
use crate::pipeline::executor::ExecutionOutcome;

/// Limits for retrying transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_secs: i64,
    pub cap_secs: i64,
    pub jitter_secs: i64,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            base_secs: config.backoff_base_secs,
            cap_secs: config.backoff_cap_secs,
            jitter_secs: config.backoff_jitter_secs.max(0),
        }
    }

    /// Backoff for attempt `n` without jitter. `n < 1` counts as 1 and the
    /// doubling saturates at the cap instead of overflowing.
    pub fn base_delay(&self, n: u32) -> i64 {
        let exponent = n.max(1) - 1;
        if exponent >= 62 {
            return self.cap_secs;
        }
        self.base_secs
            .saturating_mul(1i64 << exponent)
            .min(self.cap_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Where a target goes after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Publish,
    Retry { next_attempt_at: i64 },
    GiveUp,
}

impl RetryDecision {
    /// Compact form stored in response logs
    pub fn describe(&self) -> String {
        match self {
            RetryDecision::Publish => "publish".to_string(),
            RetryDecision::Retry { next_attempt_at } => format!("retry_at={}", next_attempt_at),
            RetryDecision::GiveUp => "give_up".to_string(),
        }
    }
}

pub struct RetryScheduler {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl RetryScheduler {
    /// Scheduler with an entropy-seeded RNG
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Scheduler whose jitter sequence is fully determined by `seed`
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        let policy = RetryPolicy::from_config(config);
        match config.seed {
            Some(seed) => Self::with_seed(policy, seed),
            None => Self::new(policy),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Seconds to wait before attempt `n + 1`, jitter included
    pub fn backoff(&self, n: u32) -> i64 {
        let jitter = if self.policy.jitter_secs > 0 {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..=self.policy.jitter_secs)
        } else {
            0
        };
        self.policy.base_delay(n).saturating_add(jitter)
    }

    /// Decide the next state of a target.
    ///
    /// `attempts` is the attempt count including the attempt that produced
    /// `outcome`.
    pub fn decide(&self, attempts: u32, outcome: &ExecutionOutcome, now: i64) -> RetryDecision {
        match outcome {
            ExecutionOutcome::Success { .. } => RetryDecision::Publish,
            ExecutionOutcome::PermanentFailure { .. } => RetryDecision::GiveUp,
            ExecutionOutcome::TransientFailure { .. } => {
                if attempts >= self.policy.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry {
                        next_attempt_at: now.saturating_add(self.backoff(attempts)),
                    }
                }
            }
        }
    }
}
