// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Output clients: one per backend endpoint.
//!
//! The router and the controller only see [`OutputClient`]; the concrete
//! [`DeliveryClient`] combines a batch, a [`DurableQueue`], a [`Pusher`] and
//! the retry/throttle policy. [`ClientFactory`] is the seam the controller
//! uses to create tenant clients.

use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

pub mod delivery;
pub mod pusher;
pub mod retry;
pub mod throttle;

pub use delivery::{DeliveryClient, DeliverySettings};
pub use pusher::{BackendKind, BasicAuth, HttpPusher, PushError, PushSettings, Pusher};
pub use retry::{Backoff, RetryPolicy};

use crate::http::{build_client, HttpSettings};
use crate::labels::LabelSet;
use crate::metrics::Metrics;
use crate::queue::{DiskQueue, DiskQueueConfig, DurableQueue, MemoryQueue, QueueError};

/// Sealed batches an unbuffered client holds while the backend is slow.
pub const UNBUFFERED_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("delivery queue is full")]
    QueueFull,
    #[error(transparent)]
    Queue(QueueError),
    #[error("a batch for {0} was dropped after exhausting its retries")]
    DeliveryFailed(String),
    #[error("client is stopped")]
    Stopped,
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to build client: {0}")]
    Build(String),
}

impl From<QueueError> for ClientError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full => ClientError::QueueFull,
            other => ClientError::Queue(other),
        }
    }
}

#[async_trait]
pub trait OutputClient: Send + Sync + Debug {
    /// Adds a line to the client's open batch.
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError>;

    /// The backend URL this client targets.
    fn endpoint(&self) -> &str;

    /// Flushes what is left and releases resources. Idempotent.
    async fn stop(&self);

    /// True once the client no longer accepts lines, after `stop` or a
    /// storage failure.
    fn is_stopped(&self) -> bool {
        false
    }
}

/// Creates tenant clients for the controller.
pub trait ClientFactory: Send + Sync + Debug {
    /// `name` identifies the tenant, `url` is the computed endpoint.
    fn create(&self, name: &str, url: &str) -> Result<Arc<dyn OutputClient>, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSettings {
    pub enabled: bool,
    /// Each client gets a sub-directory named after it.
    pub dir: PathBuf,
    pub segment_size: usize,
    pub max_segments: usize,
    pub sync: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        BufferSettings {
            enabled: false,
            dir: PathBuf::from("/var/log/log-shipper/queue"),
            segment_size: 500,
            max_segments: 20,
            sync: false,
        }
    }
}

/// Everything needed to build a client except its endpoint.
#[derive(Debug, Clone, Default)]
pub struct ClientTemplate {
    pub http: HttpSettings,
    pub push: PushSettings,
    pub delivery: DeliverySettings,
    pub buffer: BufferSettings,
}

#[derive(Debug)]
pub struct DeliveryClientFactory {
    template: ClientTemplate,
    metrics: Arc<Metrics>,
}

impl DeliveryClientFactory {
    #[must_use]
    pub fn new(template: ClientTemplate, metrics: Arc<Metrics>) -> Self {
        DeliveryClientFactory { template, metrics }
    }

    pub fn build(&self, name: &str, url: &str) -> Result<DeliveryClient, ClientError> {
        let template = &self.template;
        let (http_client, target) = build_client(&template.http, url)
            .map_err(|e| ClientError::Build(e.to_string()))?;
        let pusher = HttpPusher::new(http_client, url.to_string(), target, template.push.clone())
            .map_err(|e| ClientError::Build(e.to_string()))?;

        let queue: Arc<dyn DurableQueue> = if template.buffer.enabled {
            let dir = template.buffer.dir.join(queue_dir_name(name));
            debug!("CLIENT | Opening queue for {name} in {}", dir.display());
            Arc::new(DiskQueue::open(DiskQueueConfig {
                dir,
                segment_size: template.buffer.segment_size,
                max_segments: template.buffer.max_segments,
                sync: template.buffer.sync,
            })?)
        } else {
            Arc::new(MemoryQueue::new(UNBUFFERED_QUEUE_CAPACITY))
        };

        Ok(DeliveryClient::start(
            Arc::new(pusher),
            queue,
            template.delivery.clone(),
            Arc::clone(&self.metrics),
        ))
    }
}

impl ClientFactory for DeliveryClientFactory {
    fn create(&self, name: &str, url: &str) -> Result<Arc<dyn OutputClient>, ClientError> {
        Ok(Arc::new(self.build(name, url)?))
    }
}

fn queue_dir_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{sanitized}"),
        _ => sanitized,
    }
}
