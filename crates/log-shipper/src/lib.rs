// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Log Shipper
//!
//! Ships structured log records produced across a seed cluster and the shoot
//! control planes it hosts to one or more logging backends.
//!
//! ## Pipeline
//!
//! ```text
//!   host adapter ──> Router ──> Controller::lookup ──> tenant DeliveryClient ──┐
//!                      │                                                      │
//!                      └──────────────> default DeliveryClient ───────────────┤
//!                                                                             v
//!                                     Batch ──seal──> DurableQueue ──> Pusher (HTTP)
//! ```
//!
//! - [`router`]: per-record metadata recovery, label construction and target resolution
//! - [`controller`]: one delivery client per tenant, gated by the tenant's lifecycle state
//! - [`client`]: batching, durable queueing, retry/backoff and throttling per backend
//! - [`queue`]: on-disk and in-memory FIFO queues with at-least-once acknowledgement
//! - [`batch`]: label-keyed batches of timestamped lines
//! - [`config`]: YAML and environment configuration, validated into runtime settings

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod client;
pub mod config;
pub mod controller;
pub mod http;
pub mod labels;
pub mod line_format;
pub mod metadata;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod router;
