// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process counters shared by the router, the controller and every
//! delivery client.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::metadata::MetadataError;

/// Why a record never reached a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Metadata could not be recovered and the router drops such records.
    MissingMetadata,
    /// Both routing gates of the tenant's current state are closed.
    StateGated,
    /// The record could not be turned into a line.
    Malformed,
}

impl DropReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingMetadata => "missing_metadata",
            DropReason::StateGated => "state_gated",
            DropReason::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    forwarded_lines: AtomicU64,
    sent_lines: AtomicU64,
    dropped_missing_metadata: AtomicU64,
    dropped_state_gated: AtomicU64,
    dropped_malformed: AtomicU64,
    tag_key_missing: AtomicU64,
    tag_prefix_mismatch: AtomicU64,
    tag_format_mismatch: AtomicU64,
    routing_errors: AtomicU64,
    delivery_failures: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_non_string_keys: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub forwarded_lines: u64,
    pub sent_lines: u64,
    pub dropped_missing_metadata: u64,
    pub dropped_state_gated: u64,
    pub dropped_malformed: u64,
    pub tag_key_missing: u64,
    pub tag_prefix_mismatch: u64,
    pub tag_format_mismatch: u64,
    pub routing_errors: u64,
    pub delivery_failures: u64,
    pub dropped_batches: u64,
    pub dropped_non_string_keys: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_forwarded(&self) {
        bump(&self.forwarded_lines, 1);
    }

    pub fn record_sent(&self, lines: usize) {
        bump(&self.sent_lines, lines as u64);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::MissingMetadata => &self.dropped_missing_metadata,
            DropReason::StateGated => &self.dropped_state_gated,
            DropReason::Malformed => &self.dropped_malformed,
        };
        bump(counter, 1);
    }

    pub fn record_metadata_error(&self, error: &MetadataError) {
        let counter = match error {
            MetadataError::TagKeyMissing(_) => &self.tag_key_missing,
            MetadataError::PrefixMismatch(_) => &self.tag_prefix_mismatch,
            MetadataError::FormatMismatch(_) => &self.tag_format_mismatch,
        };
        bump(counter, 1);
    }

    pub fn record_routing_error(&self) {
        bump(&self.routing_errors, 1);
    }

    /// A batch exhausted its retries.
    pub fn record_delivery_failure(&self) {
        bump(&self.delivery_failures, 1);
    }

    /// A batch was rejected permanently by the backend.
    pub fn record_dropped_batch(&self) {
        bump(&self.dropped_batches, 1);
    }

    pub fn record_dropped_non_string_keys(&self, n: usize) {
        bump(&self.dropped_non_string_keys, n as u64);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            forwarded_lines: load(&self.forwarded_lines),
            sent_lines: load(&self.sent_lines),
            dropped_missing_metadata: load(&self.dropped_missing_metadata),
            dropped_state_gated: load(&self.dropped_state_gated),
            dropped_malformed: load(&self.dropped_malformed),
            tag_key_missing: load(&self.tag_key_missing),
            tag_prefix_mismatch: load(&self.tag_prefix_mismatch),
            tag_format_mismatch: load(&self.tag_format_mismatch),
            routing_errors: load(&self.routing_errors),
            delivery_failures: load(&self.delivery_failures),
            dropped_batches: load(&self.dropped_batches),
            dropped_non_string_keys: load(&self.dropped_non_string_keys),
        }
    }
}
