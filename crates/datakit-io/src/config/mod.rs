// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! One [`Config`] object is built at startup by the composition root and passed by
//! reference into every pipeline constructor.
//!
//! ## Configuration Priority
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. **Defaults** - see [`Config::default`]
//! 2. **TOML file** - `datakit.conf` (see [`toml::TomlConfigSource`])
//! 3. **Environment variables** - `ENV_*` (see [`env::EnvConfigSource`])
//!
//! A source that fails to load is logged and skipped; the remaining sources still
//! apply.
//!
//! ## Leniency
//!
//! Scalar values of the wrong type are logged and ignored rather than failing the whole
//! load. Filter conditions and Dataway URLs are the exception: [`Config::validate`]
//! rejects a malformed one so the agent never starts with a filter it cannot evaluate.

pub mod env;
pub mod log_level;
pub mod toml;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::log_level::LogLevel;
use crate::dataway::target::DatawayTarget;
use crate::filter::FilterSet;
use crate::point::line_protocol::Precision;
use crate::point::Category;
use crate::proc::hostname::get_hostname;
use crate::sink::SinkDescriptor;

/// Overwrites `config.field` with `source.field` when the source carries a value.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

#[macro_export]
macro_rules! merge_option {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if $source.$source_field.is_some() {
            $config.$config_field.clone_from(&$source.$source_field);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

/// Replaces a collection when the source one is non-empty. Maps are replaced, not merged.
#[macro_export]
macro_rules! merge_collection {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if !$source.$source_field.is_empty() {
            $config.$config_field.clone_from(&$source.$source_field);
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if !$source.$field.is_empty() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

pub const DEFAULT_CONFIG_FILE: &str = "/usr/local/datakit/conf.d/datakit.conf";
pub const DEFAULT_CACHE_DIR: &str = "/usr/local/datakit/cache";
const GIB: u64 = 1024 * 1024 * 1024;

/// Tag carrying the election namespace, added to election points when enabled.
pub const ELECTION_NAMESPACE_TAG: &str = "election_namespace";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("unsupported configuration field: {0}")]
    UnsupportedField(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {}", e);
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        if self.config.hostname.trim().is_empty() {
            self.config.hostname = get_hostname();
        }

        // Fall back to the conventional proxy variables when none was configured.
        if self.config.dataway.http_proxy.is_none() {
            self.config.dataway.http_proxy = ["HTTPS_PROXY", "HTTP_PROXY"]
                .iter()
                .find_map(|k| std::env::var(k).ok().filter(|v| !v.trim().is_empty()));
        }

        self.config.clone()
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct IoConfig {
    /// Capacity of the producer hand-off channel.
    pub feed_chan_size: usize,
    pub max_cache_count: usize,
    pub max_dynamic_cache_count: usize,
    pub flush_interval: Duration,
    pub max_batch_points: usize,
    pub max_batch_bytes: usize,
    pub enable_cache: bool,
    pub cache_dir: PathBuf,
    pub cache_max_bytes: u64,
    pub blocking_mode: bool,
    pub flush_grace_period: Duration,
    pub filters: HashMap<Category, Vec<String>>,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            feed_chan_size: 128,
            max_cache_count: 1000,
            max_dynamic_cache_count: 1000,
            flush_interval: Duration::from_secs(10),
            max_batch_points: 1000,
            max_batch_bytes: 4 * 1024 * 1024,
            enable_cache: false,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_max_bytes: GIB,
            blocking_mode: false,
            flush_grace_period: Duration::from_secs(5),
            filters: HashMap::new(),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct DatawayConfig {
    /// Only scheme, host, port and query are kept; each endpoint sets its own path, so
    /// a path prefix such as `/openway` is dropped.
    pub urls: Vec<String>,
    pub timeout: Duration,
    pub http_proxy: Option<String>,
    /// Zero keeps the HTTP client default.
    pub max_idle_conns_per_host: usize,
    pub enable_httptrace: bool,
    /// Post everything to `/proxy?category=...` on a Dataway proxy.
    pub proxy_mode: bool,
    pub gzip: bool,
    pub retry_count: usize,
    pub retry_backoff: Duration,
    pub precision: Precision,
    pub extra_headers: BTreeMap<String, String>,
    pub max_send_fail_count: u32,
    /// How often logging filters are pulled from Dataway. Zero disables the pull.
    pub logfilter_interval: Duration,
    /// How often the agent reports itself alive. Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for DatawayConfig {
    fn default() -> Self {
        DatawayConfig {
            urls: Vec::new(),
            timeout: Duration::from_secs(30),
            http_proxy: None,
            max_idle_conns_per_host: 0,
            enable_httptrace: false,
            proxy_mode: false,
            gzip: true,
            retry_count: crate::FLUSH_RETRY_COUNT,
            retry_backoff: Duration::from_millis(200),
            precision: Precision::Ns,
            extra_headers: BTreeMap::new(),
            max_send_fail_count: crate::dataway::MAX_SEND_FAIL_COUNT,
            logfilter_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct ElectionConfig {
    pub enable: bool,
    pub namespace: String,
    pub enable_namespace_tag: bool,
    /// Added to election points (global election tags).
    pub tags: BTreeMap<String, String>,
    pub interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        ElectionConfig {
            enable: false,
            namespace: "default".to_string(),
            enable_namespace_tag: false,
            tags: BTreeMap::new(),
            interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Config {
    /// Identity stamped into every point's `host` tag. Detected when left empty.
    pub hostname: String,
    pub log_level: LogLevel,
    pub io: IoConfig,
    pub dataway: DatawayConfig,
    pub election: ElectionConfig,
    pub global_host_tags: BTreeMap<String, String>,
    pub sinks: Vec<SinkDescriptor>,
    /// Inputs started by the agent binary.
    pub inputs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: String::new(),
            log_level: LogLevel::default(),
            io: IoConfig::default(),
            dataway: DatawayConfig::default(),
            election: ElectionConfig::default(),
            global_host_tags: BTreeMap::new(),
            sinks: Vec::new(),
            inputs: vec!["self".to_string()],
        }
    }
}

impl Config {
    /// Compiles filters and parses Dataway URLs, rejecting anything malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FilterSet::compile(&self.io.filters).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for url in &self.dataway.urls {
            DatawayTarget::parse(url).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.io.feed_chan_size == 0 {
            return Err(ConfigError::Invalid(
                "feed channel size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Defaults, then `path` (if it exists), then `ENV_*` variables.
#[must_use]
pub fn get_config(path: &Path) -> Config {
    let mut builder = ConfigBuilder::default();
    if path.exists() {
        builder = builder.add_source(Box::new(toml::TomlConfigSource {
            path: path.to_path_buf(),
        }));
    } else {
        debug!("Config file {} not found, using defaults", path.display());
    }
    builder.add_source(Box::new(env::EnvConfigSource)).build()
}

/// Strings, numbers and booleans are all accepted as text; blank values are `None`.
pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => {
            error!("Expected a string, got {}, ignoring", other);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => match humantime_serde::re::humantime::parse_duration(s.trim()) {
            Ok(d) => Ok(Some(d)),
            Err(e) => {
                error!("Failed to parse duration '{}': {}, ignoring", s, e);
                Ok(None)
            }
        },
        Some(Value::Number(n)) => match n.as_u64() {
            Some(secs) => Ok(Some(Duration::from_secs(secs))),
            None => {
                error!("Failed to parse duration {}, expected whole seconds, ignoring", n);
                Ok(None)
            }
        },
        Some(other) => {
            error!("Failed to parse duration, got {}, ignoring", other);
            Ok(None)
        }
    }
}

/// Booleans, numbers and strings. A non-empty string other than `false`/`0`/`off`
/// enables the flag.
pub fn deserialize_optional_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_f64().is_some_and(|f| f != 0.0))),
        Some(Value::String(s)) => {
            let s = s.trim().to_lowercase();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(!matches!(s.as_str(), "false" | "0" | "off" | "no")))
            }
        }
        Some(other) => {
            error!("Failed to parse flag, got {}, ignoring", other);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_usize<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64().and_then(|n| usize::try_from(n).ok())),
        Some(Value::String(s)) => match s.trim().parse() {
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                error!("Failed to parse '{}' as a count: {}, ignoring", s, e);
                Ok(None)
            }
        },
        Some(other) => {
            error!("Failed to parse count, got {}, ignoring", other);
            Ok(None)
        }
    }
}

/// Either a list or a comma separated string.
pub fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let list = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                other => {
                    error!("Expected a string list entry, got {}, ignoring", other);
                    None
                }
            })
            .collect(),
        Some(other) => {
            error!("Expected a list of strings, got {}, ignoring", other);
            Vec::new()
        }
    };
    Ok(list
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Either a table or a `k=v,k=v` string.
pub fn deserialize_key_value_pairs<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut map = BTreeMap::new();
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) if !k.trim().is_empty() => {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                    _ => error!(
                        "Failed to parse tag '{}', expected format 'key=value', ignoring",
                        pair.trim()
                    ),
                }
            }
        }
        Some(Value::Object(entries)) => {
            for (k, v) in entries {
                let v = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                map.insert(k, v);
            }
        }
        Some(other) => error!("Expected key/value pairs, got {}, ignoring", other),
    }
    Ok(map)
}

/// Category → condition list, given as a table or as a JSON string (`ENV_IO_FILTERS`).
/// Unknown categories are logged and skipped; malformed conditions are left for
/// [`Config::validate`].
pub fn deserialize_filters<'de, D>(
    deserializer: D,
) -> Result<HashMap<Category, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => return Ok(HashMap::new()),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(HashMap::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to parse filters JSON: {}, ignoring", e);
                return Ok(HashMap::new());
            }
        },
        Some(v) => v,
    };

    let Value::Object(entries) = value else {
        error!("Expected filters to be a table of category to conditions, ignoring");
        return Ok(HashMap::new());
    };

    let mut filters = HashMap::new();
    for (name, conditions) in entries {
        let category = match name.parse::<Category>() {
            Ok(c) => c,
            Err(e) => {
                error!("{}, ignoring its filters", e);
                continue;
            }
        };
        let conditions: Vec<String> = match conditions {
            Value::String(s) => vec![s],
            Value::Array(values) => values
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            other => {
                error!("Expected conditions for {}, got {}, ignoring", category, other);
                continue;
            }
        };
        filters
            .entry(category)
            .or_insert_with(Vec::new)
            .extend(conditions.into_iter().filter(|c| !c.trim().is_empty()));
    }
    Ok(filters)
}
