// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `datakit.conf` file source.
//!
//! ```toml
//! hostname = "node-1"
//! log_level = "debug"
//!
//! [io]
//! feed_chan_size = 128
//! flush_interval = "10s"
//! enable_cache = true
//! cache_dir = "/usr/local/datakit/cache"
//!
//! [io.filters]
//! logging = ["{ source = 'nginx' and status = 'debug' }"]
//!
//! [dataway]
//! urls = ["https://openway.example.com?token=tkn_xxx"]
//! timeout = "30s"
//! logfilter_interval = "10s"
//! heartbeat_interval = "30s"
//!
//! [[sinks.sink]]
//! target = "file"
//! categories = ["M"]
//! path = "/var/log/datakit/metric.json"
//! ```

use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    deserialize_filters, deserialize_key_value_pairs, deserialize_optional_duration,
    deserialize_optional_flag, deserialize_optional_string, deserialize_optional_usize,
    deserialize_string_list, log_level::LogLevel, Config, ConfigError, ConfigSource,
};
use crate::point::line_protocol::Precision;
use crate::point::Category;
use crate::sink::SinkDescriptor;
use crate::{merge_collection, merge_option, merge_option_to_value};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TomlConfig {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub hostname: Option<String>,
    pub log_level: Option<LogLevel>,
    pub io: IoSection,
    pub dataway: DatawaySection,
    pub election: ElectionSection,
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub global_host_tags: BTreeMap<String, String>,
    pub sinks: SinksSection,
    #[serde(deserialize_with = "deserialize_string_list")]
    pub inputs: Vec<String>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct IoSection {
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub feed_chan_size: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_cache_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_dynamic_cache_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub flush_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_batch_points: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_batch_bytes: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable_cache: Option<bool>,
    pub cache_dir: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub cache_max_size_gb: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub blocking_mode: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub flush_grace_period: Option<Duration>,
    #[serde(deserialize_with = "deserialize_filters")]
    pub filters: HashMap<Category, Vec<String>>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DatawaySection {
    #[serde(deserialize_with = "deserialize_string_list")]
    pub urls: Vec<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub http_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_idle_conns_per_host: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable_httptrace: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub proxy_mode: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub gzip: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub retry_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub retry_backoff: Option<Duration>,
    pub precision: Option<Precision>,
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub max_send_fail_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub logfilter_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub heartbeat_interval: Option<Duration>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ElectionSection {
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub namespace: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable_namespace_tag: Option<bool>,
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub tags: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub interval: Option<Duration>,
}

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SinksSection {
    pub sink: Vec<SinkDescriptor>,
}

fn merge_config(config: &mut Config, toml_config: &TomlConfig) {
    merge_option_to_value!(config, toml_config, hostname);
    merge_option_to_value!(config, toml_config, log_level);
    merge_collection!(config, toml_config, global_host_tags);
    merge_collection!(config, toml_config, inputs);
    merge_collection!(config, sinks, toml_config.sinks, sink);

    // IO
    let io = &toml_config.io;
    merge_option_to_value!(config.io, io, feed_chan_size);
    merge_option_to_value!(config.io, io, max_cache_count);
    merge_option_to_value!(config.io, io, max_dynamic_cache_count);
    merge_option_to_value!(config.io, io, flush_interval);
    merge_option_to_value!(config.io, io, max_batch_points);
    merge_option_to_value!(config.io, io, max_batch_bytes);
    merge_option_to_value!(config.io, io, enable_cache);
    merge_option_to_value!(config.io, io, cache_dir);
    merge_option_to_value!(config.io, io, blocking_mode);
    merge_option_to_value!(config.io, io, flush_grace_period);
    merge_collection!(config.io, io, filters);
    if let Some(gb) = io.cache_max_size_gb {
        config.io.cache_max_bytes = (gb as u64).saturating_mul(GIB);
    }

    // Dataway
    let dataway = &toml_config.dataway;
    merge_collection!(config.dataway, dataway, urls);
    merge_option_to_value!(config.dataway, dataway, timeout);
    merge_option!(config.dataway, dataway, http_proxy);
    merge_option_to_value!(config.dataway, dataway, max_idle_conns_per_host);
    merge_option_to_value!(config.dataway, dataway, enable_httptrace);
    merge_option_to_value!(config.dataway, dataway, proxy_mode);
    merge_option_to_value!(config.dataway, dataway, gzip);
    merge_option_to_value!(config.dataway, dataway, retry_count);
    merge_option_to_value!(config.dataway, dataway, retry_backoff);
    merge_option_to_value!(config.dataway, dataway, precision);
    merge_collection!(config.dataway, dataway, extra_headers);
    if let Some(max) = dataway.max_send_fail_count {
        config.dataway.max_send_fail_count = u32::try_from(max).unwrap_or(u32::MAX);
    }
    merge_option_to_value!(config.dataway, dataway, logfilter_interval);
    merge_option_to_value!(config.dataway, dataway, heartbeat_interval);

    // Election
    let election = &toml_config.election;
    merge_option_to_value!(config.election, election, enable);
    merge_option_to_value!(config.election, election, namespace);
    merge_option_to_value!(config.election, election, enable_namespace_tag);
    merge_option_to_value!(config.election, election, interval);
    merge_collection!(config.election, election, tags);
}

#[derive(Debug, PartialEq, Clone)]
pub struct TomlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for TomlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Toml::file(self.path.clone()));

        match figment.extract::<TomlConfig>() {
            Ok(toml_config) => merge_config(config, &toml_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from {}: {e}, using default config.",
                    self.path.display()
                )));
            }
        }

        Ok(())
    }
}
