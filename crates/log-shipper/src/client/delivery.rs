// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching delivery client for a single backend endpoint.
//!
//! # Architecture
//!
//! ```text
//!   handle() callers                         flush task (one per client)
//!   ────────────────                         ──────────────────────────
//!   lock batch                               every tick: seal expired batch
//!     seal if line would overflow ─┐         on wake:    drain queue
//!     add line                     │           pop ─> throttle ─> push
//!   unlock                         │             ok        ─> ack
//!                                  v             transient ─> backoff, retry
//!                            DurableQueue        permanent ─> ack, drop
//!                                  │             exhausted ─> ack, report
//!                                  └─ wake ──────>
//! ```
//!
//! Sealing swaps the active batch for an empty one while holding the batch
//! lock and pushes the sealed batch to the queue in the same critical section,
//! so no entry is lost or duplicated between the two. If the queue rejects the
//! sealed batch, it is put back and the caller sees the error.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pusher::Pusher;
use super::retry::{Backoff, RetryPolicy};
use super::throttle::Throttle;
use super::{ClientError, OutputClient};
use crate::batch::{unix_nanos, Batch};
use crate::labels::LabelSet;
use crate::metrics::Metrics;
use crate::queue::{DurableQueue, QueueError};

const MIN_TICK: Duration = Duration::from_millis(10);
const FULL_QUEUE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Seal once adding a line would exceed this many bytes.
    pub batch_size: usize,
    /// Seal once the batch is this old.
    pub batch_wait: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub retry: RetryPolicy,
    /// `0` disables throttling.
    pub requests_per_second: u32,
    /// Block `handle` while the queue is full instead of failing.
    pub block_on_full: bool,
    /// Upper bound for the final drain on stop.
    pub shutdown_deadline: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        DeliverySettings {
            batch_size: 1024 * 1024,
            batch_wait: Duration::from_secs(1),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5 * 60),
            max_retries: 10,
            retry: RetryPolicy::Bounded,
            requests_per_second: 0,
            block_on_full: false,
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

enum Delivery {
    Sent,
    Rejected,
    Exhausted,
    Cancelled,
}

#[derive(Debug)]
struct Shared {
    endpoint: String,
    settings: DeliverySettings,
    batch: Mutex<Batch>,
    next_seq: AtomicU64,
    queue: Arc<dyn DurableQueue>,
    pusher: Arc<dyn Pusher>,
    throttle: Option<Throttle>,
    wake: Notify,
    delivery_failed: AtomicBool,
    stopped: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn lock_batch(&self) -> MutexGuard<'_, Batch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves `batch` into the queue and leaves an empty batch in its place.
    fn seal(&self, batch: &mut Batch) -> Result<(), ClientError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut sealed = std::mem::take(batch);
        sealed.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        sealed.sort();

        let result = serde_json::to_vec(&sealed)
            .map_err(ClientError::from)
            .and_then(|payload| self.queue.push(payload).map_err(ClientError::from));
        if let Err(e) = result {
            *batch = sealed;
            return Err(e);
        }
        self.wake.notify_one();
        Ok(())
    }

    fn add(&self, labels: &LabelSet, timestamp: i64, line: &str) -> Result<(), ClientError> {
        let mut batch = self.lock_batch();
        // stop() seals under this lock after setting the flag
        if self.stopped.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        if batch.should_seal_before(line, self.settings.batch_size) {
            self.seal(&mut batch)?;
        }
        batch.add(labels.clone(), timestamp, line.to_string());
        Ok(())
    }

    fn seal_if_due(&self) {
        let mut batch = self.lock_batch();
        if batch.is_expired(self.settings.batch_wait)
            || batch.size_bytes() > self.settings.batch_size
        {
            if let Err(e) = self.seal(&mut batch) {
                debug!("CLIENT | Could not seal batch for {}: {e}", self.endpoint);
            }
        }
    }

    fn ack(&self, id: u64) {
        if let Err(e) = self.queue.ack(id) {
            error!("CLIENT | Failed to acknowledge item {id} for {}: {e}", self.endpoint);
            self.storage_failed(&e);
        }
    }

    /// A failing queue storage stops this client only. The owner sees
    /// `is_stopped` and may build a replacement.
    fn storage_failed(&self, e: &QueueError) {
        if matches!(e, QueueError::Io(_)) && !self.stopped.swap(true, Ordering::AcqRel) {
            error!(
                "CLIENT | Queue storage for {} failed, stopping client: {e}",
                self.endpoint
            );
            self.wake.notify_one();
        }
    }

    /// Pushes queued batches until the queue is empty. Returns `false` when
    /// cancelled or when the queue cannot be read.
    async fn drain(&self, cancel: &CancellationToken) -> bool {
        loop {
            let item = match self.queue.pop() {
                Ok(Some(item)) => item,
                Ok(None) => return true,
                Err(e) => {
                    error!("CLIENT | Failed to read queue for {}: {e}", self.endpoint);
                    self.storage_failed(&e);
                    return false;
                }
            };

            let batch: Batch = match serde_json::from_slice(&item.payload) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(
                        "CLIENT | Dropping undecodable queued batch for {}: {e}",
                        self.endpoint
                    );
                    self.ack(item.id);
                    continue;
                }
            };

            match self.deliver(&batch, cancel).await {
                Delivery::Sent => {
                    self.ack(item.id);
                    self.metrics.record_sent(batch.entry_count());
                }
                Delivery::Rejected => {
                    self.ack(item.id);
                    self.metrics.record_dropped_batch();
                }
                Delivery::Exhausted => {
                    self.ack(item.id);
                    self.delivery_failed.store(true, Ordering::Release);
                    self.metrics.record_delivery_failure();
                }
                Delivery::Cancelled => return false,
            }
        }
    }

    async fn deliver(&self, batch: &Batch, cancel: &CancellationToken) -> Delivery {
        let mut backoff = Backoff::new(self.settings.min_backoff, self.settings.max_backoff);
        let mut retries = 0u32;
        loop {
            if let Some(throttle) = &self.throttle {
                tokio::select! {
                    () = cancel.cancelled() => return Delivery::Cancelled,
                    () = throttle.acquire() => {}
                }
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Delivery::Cancelled,
                result = self.pusher.push(batch) => result,
            };

            match result {
                Ok(()) => {
                    debug!(
                        "CLIENT | Pushed batch {} with {} lines to {}",
                        batch.seq,
                        batch.entry_count(),
                        self.endpoint
                    );
                    return Delivery::Sent;
                }
                Err(e) if !e.is_retryable() => {
                    error!(
                        "CLIENT | Dropping batch {} for {}, not retryable: {e}",
                        batch.seq, self.endpoint
                    );
                    return Delivery::Rejected;
                }
                Err(e) => {
                    retries += 1;
                    if !self.settings.retry.allows(retries, self.settings.max_retries) {
                        error!(
                            "CLIENT | Giving up on batch {} for {} after {} retries: {e}",
                            batch.seq,
                            self.endpoint,
                            retries - 1
                        );
                        return Delivery::Exhausted;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        "CLIENT | Push to {} failed, retry {retries} in {delay:?}: {e}",
                        self.endpoint
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Delivery::Cancelled,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Output client owning one backend endpoint.
///
/// Construct with [`DeliveryClient::start`], which spawns the flush task; it
/// must run inside a Tokio runtime.
#[derive(Debug)]
pub struct DeliveryClient {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryClient {
    #[must_use]
    pub fn start(
        pusher: Arc<dyn Pusher>,
        queue: Arc<dyn DurableQueue>,
        settings: DeliverySettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(Shared {
            endpoint: pusher.endpoint().to_string(),
            throttle: Throttle::per_second(settings.requests_per_second),
            settings,
            batch: Mutex::new(Batch::new()),
            next_seq: AtomicU64::new(0),
            queue,
            pusher,
            wake: Notify::new(),
            delivery_failed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            metrics,
        });
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(Arc::clone(&shared), cancel.clone()));

        DeliveryClient {
            shared,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Number of sealed batches waiting for delivery.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let tick = (shared.settings.batch_wait / 10).max(MIN_TICK);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // items left by a previous process
    if !shared.queue.is_empty() {
        shared.wake.notify_one();
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => shared.seal_if_due(),
            () = shared.wake.notified() => {}
        }
        if !shared.drain(&cancel).await
            && (cancel.is_cancelled() || shared.stopped.load(Ordering::Acquire))
        {
            break;
        }
    }
    debug!("CLIENT | Flush task for {} stopped", shared.endpoint);
}

#[async_trait]
impl OutputClient for DeliveryClient {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ClientError::Stopped);
        }
        if self.shared.delivery_failed.swap(false, Ordering::AcqRel) {
            return Err(ClientError::DeliveryFailed(self.shared.endpoint.clone()));
        }

        let timestamp = unix_nanos(timestamp);
        loop {
            match self.shared.add(&labels, timestamp, &line) {
                Err(ClientError::QueueFull) if self.shared.settings.block_on_full => {
                    if self.shared.stopped.load(Ordering::Acquire) {
                        return Err(ClientError::Stopped);
                    }
                    tokio::time::sleep(FULL_QUEUE_POLL).await;
                }
                Err(ClientError::Queue(e)) => {
                    self.shared.storage_failed(&e);
                    return Err(ClientError::Queue(e));
                }
                result => return result,
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        let shared = &self.shared;
        shared.stopped.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Err(e) = worker.await {
            error!("CLIENT | Flush task for {} failed: {e}", shared.endpoint);
        }

        let sealed = {
            let mut batch = shared.lock_batch();
            shared.seal(&mut batch)
        };
        if let Err(e) = sealed {
            warn!(
                "CLIENT | Could not seal the last batch for {}: {e}",
                shared.endpoint
            );
        }

        // the flush token is already cancelled, the final drain gets its own
        let final_drain = CancellationToken::new();
        let drained = tokio::time::timeout(
            shared.settings.shutdown_deadline,
            shared.drain(&final_drain),
        )
        .await
        .unwrap_or(false);

        let remaining = shared.queue.len();
        if !drained && remaining > 0 {
            if shared.queue.is_durable() {
                info!(
                    "CLIENT | Leaving {remaining} batches for {} in the queue until restart",
                    shared.endpoint
                );
            } else {
                warn!(
                    "CLIENT | Discarding {remaining} undelivered batches for {}",
                    shared.endpoint
                );
            }
        }
        if let Err(e) = shared.queue.close() {
            error!("CLIENT | Failed to close queue for {}: {e}", shared.endpoint);
        }
        debug!("CLIENT | Stopped client for {}", shared.endpoint);
    }
}
