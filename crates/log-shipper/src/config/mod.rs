// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading and validation.
//!
//! Sources are merged in order, later sources winning:
//!
//! 1. built-in defaults
//! 2. an optional YAML file
//! 3. environment variables prefixed `LOG_SHIPPER_`, nested keys separated by
//!    `__` (e.g. `LOG_SHIPPER_CLIENT__BATCH_WAIT=500ms`)
//!
//! [`Config::validate`] compiles the raw values into the settings consumed by
//! the client factory, the controller and the router.

pub mod duration;
pub mod log_level;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use hashbrown::HashMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::client::{
    BackendKind, BasicAuth, BufferSettings, ClientTemplate, DeliverySettings, PushSettings,
    RetryPolicy,
};
use crate::controller::state::{LifecycleState, RoutingGates, StateGates};
use crate::controller::ControllerSettings;
use crate::http::{parse_tls_version, HttpSettings, TlsSettings};
use crate::labels::{FieldPath, LabelSet, LabelStrategy};
use crate::line_format::LineFormat;
use crate::metadata::{TagFallback, DEFAULT_TAG_EXPRESSION, DEFAULT_TAG_KEY, DEFAULT_TAG_PREFIX};
use crate::router::RouterSettings;
use log_level::LogLevel;

pub const ENV_PREFIX: &str = "LOG_SHIPPER_";

#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("configuration file {0} does not exist")]
    FileNotFound(PathBuf),
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid regular expression in {field}: {source}")]
    Regex {
        field: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub buffer: BufferConfig,
    pub controller: ControllerConfig,
    pub router: RouterConfig,
    pub kubernetes_metadata: KubernetesMetadataConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint of the default client.
    pub url: String,
    pub backend: BackendKind,
    pub batch_size: usize,
    #[serde(deserialize_with = "duration::deserialize")]
    pub batch_wait: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub min_backoff: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub max_backoff: Duration,
    pub max_retries: u32,
    /// Overrides the retry policy derived from the backend kind.
    pub retry: Option<RetryPolicy>,
    pub throttle: bool,
    pub requests_per_second: u32,
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_deadline: Duration,
    pub headers: BTreeMap<String, String>,
    pub tenant_header: String,
    pub tenant_id: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    pub compression: bool,
    pub compression_level: i32,
    pub tls: TlsSettings,
    pub number_of_batch_ids: u64,
    pub id_label_name: String,
    pub static_labels: LabelSet,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let delivery = DeliverySettings::default();
        let push = PushSettings::default();
        ClientConfig {
            url: "http://localhost:3100/loki/api/v1/push".to_string(),
            backend: BackendKind::Push,
            batch_size: delivery.batch_size,
            batch_wait: delivery.batch_wait,
            timeout: HttpSettings::default().timeout,
            min_backoff: delivery.min_backoff,
            max_backoff: delivery.max_backoff,
            max_retries: delivery.max_retries,
            retry: None,
            throttle: false,
            requests_per_second: 10,
            shutdown_deadline: delivery.shutdown_deadline,
            headers: BTreeMap::new(),
            tenant_header: push.tenant_header,
            tenant_id: None,
            basic_auth: None,
            bearer_token: None,
            compression: false,
            compression_level: 3,
            tls: TlsSettings::default(),
            number_of_batch_ids: 10,
            id_label_name: push.id_label_name,
            static_labels: LabelSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub segment_size: usize,
    pub max_segments: usize,
    pub sync: bool,
    pub block_on_full: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        let buffer = BufferSettings::default();
        BufferConfig {
            enabled: buffer.enabled,
            dir: buffer.dir,
            segment_size: buffer.segment_size,
            max_segments: buffer.max_segments,
            sync: buffer.sync,
            block_on_full: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub dynamic_host_prefix: String,
    pub dynamic_host_suffix: String,
    #[serde(deserialize_with = "duration::deserialize")]
    pub deleted_client_expiration: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub sweep_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub sync_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_deadline: Duration,
    /// Per-state overrides of the tenant-direction gates.
    pub tenant_gates: HashMap<LifecycleState, bool>,
    /// Per-state overrides of the default-client-direction gates.
    pub default_gates: HashMap<LifecycleState, bool>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let settings = ControllerSettings::default();
        ControllerConfig {
            dynamic_host_prefix: settings.dynamic_host_prefix,
            dynamic_host_suffix: settings.dynamic_host_suffix,
            deleted_client_expiration: settings.deleted_client_expiration,
            sweep_interval: settings.sweep_interval,
            sync_timeout: settings.sync_timeout,
            shutdown_deadline: settings.shutdown_deadline,
            tenant_gates: HashMap::new(),
            default_gates: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub dynamic_host_path: FieldPath,
    pub dynamic_host_regex: String,
    #[serde(deserialize_with = "string_list")]
    pub label_keys: Vec<String>,
    pub label_map: FieldPath,
    #[serde(deserialize_with = "string_list")]
    pub remove_keys: Vec<String>,
    pub drop_single_key: bool,
    pub line_format: LineFormat,
    pub auto_kubernetes_labels: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            dynamic_host_path: FieldPath::default(),
            dynamic_host_regex: "^shoot-".to_string(),
            label_keys: Vec::new(),
            label_map: FieldPath::default(),
            remove_keys: Vec::new(),
            drop_single_key: false,
            line_format: LineFormat::default(),
            auto_kubernetes_labels: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KubernetesMetadataConfig {
    pub fallback_to_tag: bool,
    pub drop_without_metadata: bool,
    pub tag_key: String,
    pub tag_prefix: String,
    pub tag_expression: String,
}

impl Default for KubernetesMetadataConfig {
    fn default() -> Self {
        KubernetesMetadataConfig {
            fallback_to_tag: false,
            drop_without_metadata: false,
            tag_key: DEFAULT_TAG_KEY.to_string(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            tag_expression: DEFAULT_TAG_EXPRESSION.to_string(),
        }
    }
}

/// Compiled configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Endpoint of the default client.
    pub default_url: String,
    /// Shared by the default client and every tenant client.
    pub client: ClientTemplate,
    pub controller: ControllerSettings,
    pub router: RouterSettings,
    /// Key the host adapter stores a record's tag under.
    pub tag_key: String,
    pub log_level: LogLevel,
}

impl Config {
    /// Loads defaults, then `path` when given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            debug!("CONFIG | Loading {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<Settings, ConfigError> {
        Ok(Settings {
            default_url: self.client.url.clone(),
            client: self.client_template()?,
            controller: self.controller_settings()?,
            router: self.router_settings()?,
            tag_key: self.kubernetes_metadata.tag_key.clone(),
            log_level: self.log_level,
        })
    }

    fn client_template(&self) -> Result<ClientTemplate, ConfigError> {
        let client = &self.client;
        let buffer = &self.buffer;

        reqwest::Url::parse(&client.url)
            .map_err(|e| invalid(format!("client.url {:?}: {e}", client.url)))?;
        if client.batch_size == 0 {
            return Err(invalid("client.batch_size must be greater than 0"));
        }
        if client.batch_wait.is_zero() {
            return Err(invalid("client.batch_wait must be greater than 0"));
        }
        if client.min_backoff > client.max_backoff {
            return Err(invalid(format!(
                "client.min_backoff ({:?}) exceeds client.max_backoff ({:?})",
                client.min_backoff, client.max_backoff
            )));
        }
        if client.throttle && client.requests_per_second == 0 {
            return Err(invalid(
                "client.requests_per_second must be greater than 0 when throttling",
            ));
        }
        if client.compression && !(1..=22).contains(&client.compression_level) {
            return Err(invalid(format!(
                "client.compression_level {} is outside 1..=22",
                client.compression_level
            )));
        }
        if client.tls.cert_file.is_some() != client.tls.key_file.is_some() {
            return Err(invalid(
                "client.tls.cert_file and client.tls.key_file must be set together",
            ));
        }
        for version in [&client.tls.min_version, &client.tls.max_version]
            .into_iter()
            .flatten()
        {
            parse_tls_version(version).map_err(|e| invalid(e.to_string()))?;
        }
        if buffer.enabled && buffer.segment_size == 0 {
            return Err(invalid("buffer.segment_size must be greater than 0"));
        }
        if buffer.enabled && buffer.max_segments < 2 {
            return Err(invalid("buffer.max_segments must be at least 2"));
        }

        let retry = client.retry.unwrap_or(
            match (client.backend, buffer.enabled) {
                (BackendKind::Push, true) => RetryPolicy::Unbounded,
                _ => RetryPolicy::Bounded,
            },
        );

        Ok(ClientTemplate {
            http: HttpSettings {
                timeout: client.timeout,
                tls: client.tls.clone(),
            },
            push: PushSettings {
                backend: client.backend,
                headers: client
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                tenant_header: client.tenant_header.clone(),
                tenant_id: client.tenant_id.clone(),
                basic_auth: client.basic_auth.clone(),
                bearer_token: client.bearer_token.clone(),
                compression_level: client.compression.then_some(client.compression_level),
                number_of_batch_ids: client.number_of_batch_ids,
                id_label_name: client.id_label_name.clone(),
                static_labels: client.static_labels.clone(),
            },
            delivery: DeliverySettings {
                batch_size: client.batch_size,
                batch_wait: client.batch_wait,
                min_backoff: client.min_backoff,
                max_backoff: client.max_backoff,
                max_retries: client.max_retries,
                retry,
                requests_per_second: if client.throttle {
                    client.requests_per_second
                } else {
                    0
                },
                block_on_full: buffer.block_on_full,
                shutdown_deadline: client.shutdown_deadline,
            },
            buffer: BufferSettings {
                enabled: buffer.enabled,
                dir: buffer.dir.clone(),
                segment_size: buffer.segment_size,
                max_segments: buffer.max_segments,
                sync: buffer.sync,
            },
        })
    }

    fn controller_settings(&self) -> Result<ControllerSettings, ConfigError> {
        let controller = &self.controller;
        if controller.sweep_interval.is_zero() {
            return Err(invalid("controller.sweep_interval must be greater than 0"));
        }
        Ok(ControllerSettings {
            dynamic_host_prefix: controller.dynamic_host_prefix.clone(),
            dynamic_host_suffix: controller.dynamic_host_suffix.clone(),
            deleted_client_expiration: controller.deleted_client_expiration,
            sweep_interval: controller.sweep_interval,
            sync_timeout: controller.sync_timeout,
            shutdown_deadline: controller.shutdown_deadline,
            gates: RoutingGates {
                tenant: apply_overrides(StateGates::tenant_defaults(), &controller.tenant_gates),
                default: apply_overrides(
                    StateGates::default_client_defaults(),
                    &controller.default_gates,
                ),
            },
        })
    }

    fn router_settings(&self) -> Result<RouterSettings, ConfigError> {
        let router = &self.router;
        let metadata = &self.kubernetes_metadata;

        let tag_fallback = if metadata.fallback_to_tag {
            Some(
                TagFallback::new(
                    &metadata.tag_key,
                    &metadata.tag_prefix,
                    &metadata.tag_expression,
                )
                .map_err(ConfigError::Invalid)?,
            )
        } else {
            None
        };
        let dynamic_host_regex =
            Regex::new(&router.dynamic_host_regex).map_err(|source| ConfigError::Regex {
                field: "router.dynamic_host_regex",
                source,
            })?;

        Ok(RouterSettings {
            tag_fallback,
            drop_without_metadata: metadata.drop_without_metadata,
            labels: LabelStrategy::select(
                router.auto_kubernetes_labels,
                &router.label_map,
                &router.label_keys,
            ),
            dynamic_host_path: router.dynamic_host_path.clone(),
            dynamic_host_regex,
            remove_keys: router.remove_keys.clone(),
            drop_single_key: router.drop_single_key,
            line_format: router.line_format,
        })
    }
}

fn apply_overrides(mut gates: StateGates, overrides: &HashMap<LifecycleState, bool>) -> StateGates {
    for (state, open) in overrides {
        gates.set(*state, *open);
    }
    gates
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Accepts a YAML sequence or a comma-separated string, as environment
/// variables provide.
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringList {
        List(Vec<String>),
        Joined(String),
    }

    Ok(match StringList::deserialize(deserializer)? {
        StringList::List(items) => items,
        StringList::Joined(joined) => joined
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelStrategy;

    fn load(path: Option<&str>) -> Result<Config, ConfigError> {
        Config::load(path.map(Path::new))
    }

    #[test]
    fn test_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();

            let config = load(None).unwrap();
            assert_eq!(config, Config::default());

            let settings = config.validate().unwrap();
            assert_eq!(settings.default_url, "http://localhost:3100/loki/api/v1/push");
            assert_eq!(settings.client.delivery.retry, RetryPolicy::Bounded);
            assert_eq!(settings.client.delivery.requests_per_second, 0);
            assert_eq!(settings.client.push.compression_level, None);
            assert_eq!(settings.controller.gates, RoutingGates::default());
            assert!(settings.router.tag_fallback.is_none());
            assert_eq!(settings.router.labels, LabelStrategy::Keys(Vec::new()));
            assert_eq!(settings.tag_key, "tag");
            assert_eq!(settings.log_level, LogLevel::Info);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "shipper.yaml",
                r#"
log_level: debug
client:
  url: https://logs.example.com/push
  batch_size: 2048
  batch_wait: 250ms
  max_backoff: 2m
  max_retries: 3
  throttle: true
  requests_per_second: 5
  headers:
    X-Team: observability
  tenant_id: seed
  compression: true
  compression_level: 7
  static_labels:
    origin: seed
buffer:
  enabled: true
  dir: /tmp/queues
  max_segments: 4
controller:
  deleted_client_expiration: 30m
  sweep_interval: 15
router:
  dynamic_host_path:
    kubernetes:
      namespace_name: namespace
  dynamic_host_regex: "^shoot--"
  label_keys: [level, stream]
  remove_keys: [time]
  line_format: logfmt
"#,
            )?;

            let settings = load(Some("shipper.yaml")).unwrap().validate().unwrap();

            assert_eq!(settings.log_level, LogLevel::Debug);
            assert_eq!(settings.default_url, "https://logs.example.com/push");
            let delivery = &settings.client.delivery;
            assert_eq!(delivery.batch_size, 2048);
            assert_eq!(delivery.batch_wait, Duration::from_millis(250));
            assert_eq!(delivery.max_backoff, Duration::from_secs(120));
            assert_eq!(delivery.max_retries, 3);
            assert_eq!(delivery.requests_per_second, 5);
            assert_eq!(delivery.retry, RetryPolicy::Unbounded);
            let push = &settings.client.push;
            assert_eq!(
                push.headers,
                vec![("X-Team".to_string(), "observability".to_string())]
            );
            assert_eq!(push.tenant_id.as_deref(), Some("seed"));
            assert_eq!(push.compression_level, Some(7));
            assert_eq!(push.static_labels.get("origin").map(String::as_str), Some("seed"));
            assert!(settings.client.buffer.enabled);
            assert_eq!(settings.client.buffer.dir, PathBuf::from("/tmp/queues"));
            assert_eq!(settings.client.buffer.max_segments, 4);
            assert_eq!(
                settings.controller.deleted_client_expiration,
                Duration::from_secs(1800)
            );
            assert_eq!(settings.controller.sweep_interval, Duration::from_secs(15));
            assert!(!settings.router.dynamic_host_path.is_empty());
            assert!(settings.router.dynamic_host_regex.is_match("shoot--dev--a"));
            assert_eq!(
                settings.router.labels,
                LabelStrategy::Keys(vec!["level".to_string(), "stream".to_string()])
            );
            assert_eq!(settings.router.remove_keys, vec!["time".to_string()]);
            assert_eq!(settings.router.line_format, LineFormat::Logfmt);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("shipper.yaml", "client:\n  batch_wait: 5s\n  max_retries: 3\n")?;
            jail.set_env("LOG_SHIPPER_CLIENT__BATCH_WAIT", "500ms");
            jail.set_env("LOG_SHIPPER_ROUTER__LABEL_KEYS", "level, stream");
            jail.set_env("LOG_SHIPPER_LOG_LEVEL", "warn");

            let config = load(Some("shipper.yaml")).unwrap();

            assert_eq!(config.client.batch_wait, Duration::from_millis(500));
            assert_eq!(config.client.max_retries, 3);
            assert_eq!(
                config.router.label_keys,
                vec!["level".to_string(), "stream".to_string()]
            );
            assert_eq!(config.log_level, LogLevel::Warn);
            Ok(())
        });
    }

    #[test]
    fn test_gate_overrides_keep_other_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "shipper.yaml",
                "controller:\n  tenant_gates:\n    hibernated: true\n    migrating: false\n",
            )?;
            jail.set_env("LOG_SHIPPER_CONTROLLER__DEFAULT_GATES__READY", "true");

            let gates = load(Some("shipper.yaml"))
                .unwrap()
                .validate()
                .unwrap()
                .controller
                .gates;

            let mut tenant = StateGates::tenant_defaults();
            tenant.set(LifecycleState::Hibernated, true);
            tenant.set(LifecycleState::Migrating, false);
            let mut default = StateGates::default_client_defaults();
            default.set(LifecycleState::Ready, true);
            assert_eq!(gates.tenant, tenant);
            assert_eq!(gates.default, default);
            Ok(())
        });
    }

    #[test]
    fn test_retry_policy_by_backend() {
        let mut config = Config::default();
        config.buffer.enabled = true;
        assert_eq!(
            config.validate().unwrap().client.delivery.retry,
            RetryPolicy::Unbounded
        );

        config.client.backend = BackendKind::Otlp;
        assert_eq!(
            config.validate().unwrap().client.delivery.retry,
            RetryPolicy::Bounded
        );

        config.client.retry = Some(RetryPolicy::Unbounded);
        assert_eq!(
            config.validate().unwrap().client.delivery.retry,
            RetryPolicy::Unbounded
        );
    }

    #[test]
    fn test_label_map_takes_precedence_over_keys() {
        let mut config = Config::default();
        config.router.label_keys = vec!["level".to_string()];
        config.router.label_map =
            FieldPath::from_json(&serde_json::json!({"kubernetes": {"pod_name": "pod"}})).unwrap();

        assert!(matches!(
            config.validate().unwrap().router.labels,
            LabelStrategy::Map(_)
        ));

        config.router.auto_kubernetes_labels = true;
        assert_eq!(
            config.validate().unwrap().router.labels,
            LabelStrategy::AutoKubernetes
        );
    }

    #[test]
    fn test_tag_fallback_compiled_when_enabled() {
        let mut config = Config::default();
        config.kubernetes_metadata.fallback_to_tag = true;
        assert!(config.validate().unwrap().router.tag_fallback.is_some());

        config.kubernetes_metadata.tag_expression = r"\.(.+)$".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases: Vec<(&str, Box<dyn Fn(&mut Config)>)> = vec![
            ("url", Box::new(|c: &mut Config| c.client.url = "not a url".to_string())),
            ("batch size", Box::new(|c: &mut Config| c.client.batch_size = 0)),
            ("batch wait", Box::new(|c: &mut Config| c.client.batch_wait = Duration::ZERO)),
            (
                "backoff",
                Box::new(|c: &mut Config| c.client.min_backoff = c.client.max_backoff + Duration::from_secs(1)),
            ),
            (
                "throttle",
                Box::new(|c: &mut Config| {
                    c.client.throttle = true;
                    c.client.requests_per_second = 0;
                }),
            ),
            (
                "compression",
                Box::new(|c: &mut Config| {
                    c.client.compression = true;
                    c.client.compression_level = 40;
                }),
            ),
            (
                "identity",
                Box::new(|c: &mut Config| c.client.tls.cert_file = Some(PathBuf::from("/tls/cert.pem"))),
            ),
            (
                "tls version",
                Box::new(|c: &mut Config| c.client.tls.min_version = Some("1.7".to_string())),
            ),
            (
                "segments",
                Box::new(|c: &mut Config| {
                    c.buffer.enabled = true;
                    c.buffer.max_segments = 1;
                }),
            ),
            (
                "sweep",
                Box::new(|c: &mut Config| c.controller.sweep_interval = Duration::ZERO),
            ),
        ];

        for (name, mutate) in cases {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{name}"
            );
        }
    }

    #[test]
    fn test_invalid_regex() {
        let mut config = Config::default();
        config.router.dynamic_host_regex = "(unclosed".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Regex {
                field: "router.dynamic_host_regex",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            assert!(matches!(
                load(Some("absent.yaml")),
                Err(ConfigError::FileNotFound(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_value_fails_to_load() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOG_SHIPPER_CLIENT__BATCH_WAIT", "soon");
            assert!(matches!(load(None), Err(ConfigError::Load(_))));
            Ok(())
        });
    }
}
