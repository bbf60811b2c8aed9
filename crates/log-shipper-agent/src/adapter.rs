// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-delimited JSON host adapter.
//!
//! Each input line is one envelope:
//!
//! ```text
//! {"kind":"record","tag":"kubernetes.var.log.containers.…","timestamp":1700000000.5,"record":{…}}
//! {"kind":"record","record":[["log","hello"],[7,"dropped"]]}
//! {"kind":"cluster","action":"add","cluster":{"name":"shoot--dev--a",…}}
//! {"kind":"cluster","action":"synced"}
//! ```
//!
//! Records may arrive as an object or as a list of key/value pairs; pairs with
//! non-string keys are dropped and counted.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use log_shipper::controller::{ClusterEvent, ClusterObject};
use log_shipper::metrics::{DropReason, Metrics};
use log_shipper::record::{record_from_json, record_from_pairs, Record, Value};
use log_shipper::router::{RouteOutcome, Router};

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Record {
        tag: Option<String>,
        /// Seconds since the epoch.
        timestamp: Option<f64>,
        record: RecordPayload,
    },
    Cluster {
        action: ClusterAction,
        cluster: Option<ClusterObject>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordPayload {
    Pairs(Vec<(serde_json::Value, serde_json::Value)>),
    Json(serde_json::Value),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClusterAction {
    Add,
    Update,
    Delete,
    Synced,
}

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Routed(RouteOutcome),
    /// Routing failed; `retryable` tells whether a host with chunk semantics
    /// would re-deliver the record.
    Failed { retryable: bool },
    Event,
    Invalid,
}

pub struct Adapter {
    router: Arc<Router>,
    events: mpsc::Sender<ClusterEvent>,
    tag_key: String,
    metrics: Arc<Metrics>,
}

impl Adapter {
    pub fn new(
        router: Arc<Router>,
        events: mpsc::Sender<ClusterEvent>,
        tag_key: String,
        metrics: Arc<Metrics>,
    ) -> Self {
        Adapter {
            router,
            events,
            tag_key,
            metrics,
        }
    }

    /// Handles lines until end of input.
    pub async fn run<R: AsyncBufRead + Unpin>(&self, reader: R) -> std::io::Result<()> {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            self.handle_line(&line).await;
        }
        debug!("ADAPTER | End of input");
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> Handled {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("ADAPTER | Skipping malformed envelope: {e}");
                self.metrics.record_dropped(DropReason::Malformed);
                return Handled::Invalid;
            }
        };

        match envelope {
            Envelope::Record {
                tag,
                timestamp,
                record,
            } => {
                let Some(mut record) = self.normalize(record) else {
                    warn!("ADAPTER | Skipping record that is not a map");
                    self.metrics.record_dropped(DropReason::Malformed);
                    return Handled::Invalid;
                };
                if let Some(tag) = tag {
                    record
                        .entry(self.tag_key.clone())
                        .or_insert(Value::String(tag));
                }
                self.route(record, to_system_time(timestamp)).await
            }
            Envelope::Cluster { action, cluster } => {
                let event = match (action, cluster) {
                    (ClusterAction::Synced, _) => ClusterEvent::Synced,
                    (ClusterAction::Add, Some(cluster)) => ClusterEvent::Added(cluster),
                    (ClusterAction::Update, Some(cluster)) => ClusterEvent::Updated(cluster),
                    (ClusterAction::Delete, Some(cluster)) => ClusterEvent::Deleted(cluster),
                    (action, None) => {
                        warn!("ADAPTER | Cluster event {action:?} without a cluster object");
                        return Handled::Invalid;
                    }
                };
                if self.events.send(event).await.is_err() {
                    warn!("ADAPTER | Controller is not consuming cluster events");
                }
                Handled::Event
            }
        }
    }

    fn normalize(&self, payload: RecordPayload) -> Option<Record> {
        match payload {
            RecordPayload::Json(value) => record_from_json(value),
            RecordPayload::Pairs(pairs) => {
                let (record, skipped) = record_from_pairs(pairs);
                if skipped > 0 {
                    debug!("ADAPTER | Dropped {skipped} non-string keys");
                    self.metrics.record_dropped_non_string_keys(skipped);
                }
                Some(record)
            }
        }
    }

    async fn route(&self, record: Record, timestamp: SystemTime) -> Handled {
        match self.router.route(record, timestamp).await {
            Ok(outcome) => Handled::Routed(outcome),
            Err(e) if e.is_retryable() => {
                warn!("ADAPTER | Record not delivered, retryable: {e}");
                Handled::Failed { retryable: true }
            }
            Err(e) => {
                error!("ADAPTER | Record not delivered: {e}");
                Handled::Failed { retryable: false }
            }
        }
    }
}

fn to_system_time(timestamp: Option<f64>) -> SystemTime {
    timestamp
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map_or_else(SystemTime::now, |since_epoch| UNIX_EPOCH + since_epoch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use log_shipper::client::{ClientError, OutputClient};
    use log_shipper::labels::{FieldPath, LabelSet, LabelStrategy};
    use log_shipper::line_format::LineFormat;
    use log_shipper::router::RouterSettings;
    use regex::Regex;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CapturingClient {
        lines: Mutex<Vec<(LabelSet, SystemTime, String)>>,
    }

    #[async_trait]
    impl OutputClient for CapturingClient {
        async fn handle(
            &self,
            labels: LabelSet,
            timestamp: SystemTime,
            line: String,
        ) -> Result<(), ClientError> {
            self.lines.lock().unwrap().push((labels, timestamp, line));
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "http://default"
        }

        async fn stop(&self) {}
    }

    fn adapter() -> (Adapter, Arc<CapturingClient>, mpsc::Receiver<ClusterEvent>) {
        let client = Arc::new(CapturingClient::default());
        let metrics = Arc::new(Metrics::new());
        let settings = RouterSettings {
            tag_fallback: None,
            drop_without_metadata: false,
            labels: LabelStrategy::Keys(vec!["level".to_string()]),
            dynamic_host_path: FieldPath::default(),
            dynamic_host_regex: Regex::new("^shoot-").unwrap(),
            remove_keys: vec!["tag".to_string()],
            drop_single_key: true,
            line_format: LineFormat::Json,
        };
        let router = Arc::new(Router::new(
            settings,
            None,
            Arc::clone(&client) as Arc<dyn OutputClient>,
            Arc::clone(&metrics),
        ));
        let (tx, rx) = mpsc::channel(8);
        (
            Adapter::new(router, tx, "tag".to_string(), metrics),
            client,
            rx,
        )
    }

    #[tokio::test]
    async fn test_record_envelope_is_routed() {
        let (adapter, client, _rx) = adapter();

        let handled = adapter
            .handle_line(
                r#"{"kind":"record","tag":"app.web","timestamp":1700000000.5,"record":{"level":"info","log":"hello"}}"#,
            )
            .await;

        assert!(matches!(handled, Handled::Routed(RouteOutcome::Forwarded { .. })));
        let lines = client.lines.lock().unwrap();
        let (labels, timestamp, line) = &lines[0];
        assert_eq!(labels.get("level").map(String::as_str), Some("info"));
        assert_eq!(
            *timestamp,
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_500)
        );
        assert_eq!(line, "hello");
    }

    #[tokio::test]
    async fn test_pairs_with_non_string_keys_are_counted() {
        let (adapter, client, _rx) = adapter();

        adapter
            .handle_line(r#"{"kind":"record","record":[["log","hello"],[7,"x"],[true,"y"]]}"#)
            .await;

        assert_eq!(adapter.metrics.snapshot().dropped_non_string_keys, 2);
        assert_eq!(client.lines.lock().unwrap()[0].2, "hello");
    }

    #[tokio::test]
    async fn test_cluster_envelopes_become_events() {
        let (adapter, _client, mut rx) = adapter();

        let handled = adapter
            .handle_line(r#"{"kind":"cluster","action":"add","cluster":{"name":"shoot--dev--a"}}"#)
            .await;
        adapter
            .handle_line(r#"{"kind":"cluster","action":"synced"}"#)
            .await;

        assert_eq!(handled, Handled::Event);
        match rx.recv().await {
            Some(ClusterEvent::Added(cluster)) => assert_eq!(cluster.name, "shoot--dev--a"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ClusterEvent::Synced)));
    }

    #[tokio::test]
    async fn test_invalid_input() {
        let (adapter, client, _rx) = adapter();

        assert_eq!(adapter.handle_line("not json").await, Handled::Invalid);
        assert_eq!(
            adapter
                .handle_line(r#"{"kind":"record","record":"flat string"}"#)
                .await,
            Handled::Invalid
        );
        assert_eq!(
            adapter
                .handle_line(r#"{"kind":"cluster","action":"delete"}"#)
                .await,
            Handled::Invalid
        );
        assert!(client.lines.lock().unwrap().is_empty());
        assert_eq!(adapter.metrics.snapshot().dropped_malformed, 2);
    }

    #[tokio::test]
    async fn test_run_reads_until_eof() {
        let (adapter, client, _rx) = adapter();
        let input = "{\"kind\":\"record\",\"record\":{\"log\":\"a\"}}\n\n{\"kind\":\"record\",\"record\":{\"log\":\"b\"}}\n";

        adapter.run(input.as_bytes()).await.unwrap();

        let lines: Vec<String> = client
            .lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, line)| line.clone())
            .collect();
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }
}
