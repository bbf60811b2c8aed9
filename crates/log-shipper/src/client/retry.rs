// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::time::Duration;

/// How long a delivery client keeps retrying a transient push failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Give up after `max_retries` retries and report the failure upward.
    Bounded,
    /// Retry until the push succeeds or the client stops. Used when the item
    /// is already persisted in a durable queue.
    Unbounded,
}

impl RetryPolicy {
    /// Whether retry number `retry` (1-based) may run.
    #[must_use]
    pub fn allows(self, retry: u32, max_retries: u32) -> bool {
        match self {
            RetryPolicy::Bounded => retry <= max_retries,
            RetryPolicy::Unbounded => true,
        }
    }
}

/// Exponential backoff doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Backoff {
            min,
            max,
            current: min,
        }
    }

    /// Delay before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
