// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry policies and backoff math.
//!
//! Two formulas live here: the job queue's doubling backoff
//! (`min(base · 2^(n−1), max)`) and the workflow step policy
//! (`min(interval · rate^(n−1), max)`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for workflow task and poll steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub backoff_rate: f64,
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 1_000,
            backoff_rate: 2.0,
            max_interval_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let raw = self.interval_ms as f64 * self.backoff_rate.powi(exp as i32);
        let capped = if raw.is_finite() {
            (raw as u64).min(self.max_interval_ms)
        } else {
            self.max_interval_ms
        };
        Duration::from_millis(capped)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Job-queue backoff: `min(base · 2^(n−1), max)` for attempt `n` (1-based).
pub fn queue_backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    let delay = base_ms.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
    Duration::from_millis(delay.min(max_ms))
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
