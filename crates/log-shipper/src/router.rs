// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record routing.
//!
//! ```text
//!   record ─> recover metadata from tag (when missing)
//!          ─> build labels
//!          ─> resolve tenant via dynamic host path
//!          ─> tenant matches dynamic host regex?
//!               yes: controller lookup ─┬─ no entry            -> NoClient (retryable)
//!                                       ├─ both gates closed   -> Dropped
//!                                       └─ tenant and/or default client
//!               no:  default client
//!          ─> remove label and configured keys, format line, hand to client(s)
//! ```
//!
//! No per-record state outlives a `route` call.

use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

use crate::client::{ClientError, OutputClient};
use crate::controller::Controller;
use crate::labels::{FieldPath, LabelSet, LabelStrategy};
use crate::line_format::{format_line, LineFormat};
use crate::metadata::{has_metadata, TagFallback};
use crate::metrics::{DropReason, Metrics};
use crate::record::Record;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no client found for tenant {0}")]
    NoClient(String),
    #[error("client for {endpoint} failed: {source}")]
    Client {
        endpoint: String,
        #[source]
        source: ClientError,
    },
    #[error("failed to format line: {0}")]
    Format(#[from] serde_json::Error),
    #[error("router is stopped")]
    Stopped,
}

impl RouteError {
    /// Whether the host should deliver the record's chunk again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            RouteError::NoClient(_) | RouteError::Stopped => true,
            RouteError::Client { source, .. } => !matches!(
                source,
                ClientError::Encode(_) | ClientError::Build(_)
            ),
            RouteError::Format(_) => false,
        }
    }
}

/// Where a record went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded {
        /// Tenant whose own client received the line.
        tenant: Option<String>,
        /// Whether the default client received the line.
        default: bool,
    },
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Recovers metadata from the tag when the record has none.
    pub tag_fallback: Option<TagFallback>,
    pub drop_without_metadata: bool,
    pub labels: LabelStrategy,
    pub dynamic_host_path: FieldPath,
    pub dynamic_host_regex: Regex,
    pub remove_keys: Vec<String>,
    pub drop_single_key: bool,
    pub line_format: LineFormat,
}

#[derive(Debug)]
pub struct Router {
    settings: RouterSettings,
    controller: Option<Arc<Controller>>,
    default_client: Arc<dyn OutputClient>,
    metrics: Arc<Metrics>,
    stopped: AtomicBool,
}

impl Router {
    #[must_use]
    pub fn new(
        settings: RouterSettings,
        controller: Option<Arc<Controller>>,
        default_client: Arc<dyn OutputClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Router {
            settings,
            controller,
            default_client,
            metrics,
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn route(
        &self,
        mut record: Record,
        timestamp: SystemTime,
    ) -> Result<RouteOutcome, RouteError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RouteError::Stopped);
        }
        let settings = &self.settings;

        if let Some(fallback) = &settings.tag_fallback {
            if !has_metadata(&record) {
                if let Err(e) = fallback.recover(&mut record) {
                    self.metrics.record_metadata_error(&e);
                    if settings.drop_without_metadata {
                        debug!("ROUTER | Dropping record without metadata: {e}");
                        return Ok(self.dropped(DropReason::MissingMetadata));
                    }
                    debug!("ROUTER | Forwarding record without metadata: {e}");
                }
            }
        }

        let labels = settings.labels.extract(&record);
        let tenant = settings.dynamic_host_path.resolve(&record);

        let mut tenant_client = None;
        let mut to_default = true;
        if let Some(controller) = self.dynamic_target(&tenant) {
            let Some(route) = controller.lookup(&tenant) else {
                self.metrics.record_routing_error();
                return Err(RouteError::NoClient(tenant));
            };
            if !route.to_tenant && !route.to_default {
                debug!(
                    "ROUTER | Dropping record of {tenant}, no gate open in state {}",
                    route.state
                );
                return Ok(self.dropped(DropReason::StateGated));
            }
            to_default = route.to_default;
            if route.to_tenant {
                tenant_client = Some(route.client);
            }
        }

        for key in settings
            .labels
            .consumed_keys()
            .iter()
            .chain(settings.remove_keys.iter())
        {
            record.remove(key);
        }
        let line = match format_line(&record, settings.line_format, settings.drop_single_key) {
            Ok(line) => line,
            Err(e) => {
                self.metrics.record_dropped(DropReason::Malformed);
                return Err(e.into());
            }
        };

        if let Some(client) = &tenant_client {
            send(client, labels.clone(), timestamp, line.clone()).await?;
        }
        if to_default {
            send(&self.default_client, labels, timestamp, line).await?;
        }
        self.metrics.record_forwarded();

        Ok(RouteOutcome::Forwarded {
            tenant: tenant_client.map(|_| tenant),
            default: to_default,
        })
    }

    /// The controller, when `tenant` is a dynamic host it manages.
    fn dynamic_target(&self, tenant: &str) -> Option<&Arc<Controller>> {
        if tenant.is_empty() || !self.settings.dynamic_host_regex.is_match(tenant) {
            return None;
        }
        self.controller.as_ref()
    }

    fn dropped(&self, reason: DropReason) -> RouteOutcome {
        self.metrics.record_dropped(reason);
        RouteOutcome::Dropped(reason)
    }

    /// Stops accepting records, then stops the controller with every tenant
    /// client and finally the default client.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("ROUTER | Stopping");
        if let Some(controller) = &self.controller {
            controller.stop().await;
        }
        self.default_client.stop().await;
    }
}

async fn send(
    client: &Arc<dyn OutputClient>,
    labels: LabelSet,
    timestamp: SystemTime,
    line: String,
) -> Result<(), RouteError> {
    client
        .handle(labels, timestamp, line)
        .await
        .map_err(|source| RouteError::Client {
            endpoint: client.endpoint().to_string(),
            source,
        })
}
