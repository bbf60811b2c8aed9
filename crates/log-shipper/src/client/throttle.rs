// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Spaces outbound requests at least `1 / requests_per_second` apart.
///
/// Independent from retry backoff: a retry waits for its backoff and then
/// for its throttle slot.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Throttle {
    /// Returns `None` for a zero rate, meaning unthrottled.
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Option<Self> {
        if requests_per_second == 0 {
            return None;
        }
        Some(Throttle {
            interval: Duration::from_secs(1) / requests_per_second,
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Waits for the next free slot.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        if *next_slot > now {
            sleep_until(*next_slot).await;
        }
        *next_slot = (*next_slot).max(now) + self.interval;
    }
}
