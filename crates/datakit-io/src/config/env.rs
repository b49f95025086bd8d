// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `ENV_*` environment variable source, the usual way to configure a containerised agent.

use figment::{providers::Env, Figment};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

use crate::config::{
    deserialize_filters, deserialize_key_value_pairs, deserialize_optional_duration,
    deserialize_optional_flag, deserialize_optional_string, deserialize_optional_usize,
    deserialize_string_list, log_level::LogLevel, Config, ConfigError, ConfigSource,
};
use crate::point::Category;
use crate::sink::SinkDescriptor;
use crate::{merge_collection, merge_option, merge_option_to_value};

const PREFIX: &str = "ENV_";
// Filters and sinks are read verbatim, outside figment's value parsing.
const FILTERS_VAR: &str = "ENV_IO_FILTERS";
const SINK_VAR_PREFIX: &str = "ENV_SINK_";

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EnvConfig {
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub hostname: Option<String>,
    pub log_level: Option<LogLevel>,

    // Dataway
    #[serde(deserialize_with = "deserialize_string_list")]
    pub dataway: Vec<String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub dataway_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub dataway_http_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub dataway_max_idle_conns_per_host: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub dataway_enable_httptrace: Option<bool>,

    // IO
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub io_queue_size: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub io_max_cache_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub io_max_dynamic_cache_count: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub io_flush_interval: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub io_enable_cache: Option<bool>,
    pub io_cache_dir: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_optional_usize")]
    pub io_cache_max_size_gb: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub io_blocking_mode: Option<bool>,

    // Election
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable_election: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub namespace: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_flag")]
    pub enable_election_namespace_tag: Option<bool>,

    // Tags
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub global_host_tags: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_key_value_pairs")]
    pub global_election_tags: BTreeMap<String, String>,
}

fn merge_config(config: &mut Config, env_config: &EnvConfig) {
    merge_option_to_value!(config, env_config, hostname);
    merge_option_to_value!(config, env_config, log_level);

    // Dataway
    merge_collection!(config.dataway, urls, env_config, dataway);
    merge_option_to_value!(config.dataway, timeout, env_config, dataway_timeout);
    merge_option!(config.dataway, http_proxy, env_config, dataway_http_proxy);
    merge_option_to_value!(
        config.dataway,
        max_idle_conns_per_host,
        env_config,
        dataway_max_idle_conns_per_host
    );
    merge_option_to_value!(
        config.dataway,
        enable_httptrace,
        env_config,
        dataway_enable_httptrace
    );

    // IO
    merge_option_to_value!(config.io, feed_chan_size, env_config, io_queue_size);
    merge_option_to_value!(config.io, max_cache_count, env_config, io_max_cache_count);
    merge_option_to_value!(
        config.io,
        max_dynamic_cache_count,
        env_config,
        io_max_dynamic_cache_count
    );
    merge_option_to_value!(config.io, flush_interval, env_config, io_flush_interval);
    merge_option_to_value!(config.io, enable_cache, env_config, io_enable_cache);
    merge_option_to_value!(config.io, cache_dir, env_config, io_cache_dir);
    merge_option_to_value!(config.io, blocking_mode, env_config, io_blocking_mode);
    if let Some(gb) = env_config.io_cache_max_size_gb {
        config.io.cache_max_bytes = (gb as u64).saturating_mul(GIB);
    }

    // Election
    merge_option_to_value!(config.election, enable, env_config, enable_election);
    merge_option_to_value!(config.election, namespace, env_config, namespace);
    merge_option_to_value!(
        config.election,
        enable_namespace_tag,
        env_config,
        enable_election_namespace_tag
    );
    merge_collection!(config.election, tags, env_config, global_election_tags);
    merge_collection!(config, env_config, global_host_tags);
}

/// `ENV_SINK_<X>` descriptors, `X` being a category short name (`M`, `L`, `CO`, ...).
fn sinks_from_env() -> Vec<SinkDescriptor> {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| k.starts_with(SINK_VAR_PREFIX))
        .collect();
    vars.sort();

    let mut sinks = Vec::new();
    for (key, value) in vars {
        let suffix = &key[SINK_VAR_PREFIX.len()..];
        let Some(category) = Category::from_short_name(suffix) else {
            error!("Unknown category in {}, ignoring", key);
            continue;
        };
        sinks.extend(SinkDescriptor::parse_env(category, &value));
    }
    sinks
}

#[derive(Debug, PartialEq, Clone, Copy)]
#[allow(clippy::module_name_repetitions)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(
            Env::prefixed(PREFIX)
                .ignore(&["io_filters"])
                .filter(|k| !k.as_str().to_ascii_lowercase().starts_with("sink_")),
        );

        match figment.extract::<EnvConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        if let Ok(raw) = std::env::var(FILTERS_VAR) {
            let value = serde_json::Value::String(raw);
            match deserialize_filters(value) {
                Ok(filters) if !filters.is_empty() => config.io.filters = filters,
                Ok(_) => {}
                Err(e) => error!("Failed to parse {}: {}, ignoring", FILTERS_VAR, e),
            }
        }

        let sinks = sinks_from_env();
        if !sinks.is_empty() {
            config.sinks = sinks;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("ENV_HOSTNAME", "node-7");
            jail.set_env("ENV_LOG_LEVEL", "warn");
            jail.set_env(
                "ENV_DATAWAY",
                "https://a.example.com?token=t1,https://b.example.com?token=t2",
            );
            jail.set_env("ENV_DATAWAY_TIMEOUT", "5s");
            jail.set_env("ENV_DATAWAY_ENABLE_HTTPTRACE", "yes");
            jail.set_env("ENV_IO_QUEUE_SIZE", "32");
            jail.set_env("ENV_IO_MAX_CACHE_COUNT", "10");
            jail.set_env("ENV_IO_MAX_DYNAMIC_CACHE_COUNT", "20");
            jail.set_env("ENV_IO_FLUSH_INTERVAL", "500ms");
            jail.set_env("ENV_IO_ENABLE_CACHE", "on");
            jail.set_env("ENV_IO_CACHE_MAX_SIZE_GB", "3");
            jail.set_env("ENV_IO_BLOCKING_MODE", "false");
            jail.set_env("ENV_ENABLE_ELECTION", "1");
            jail.set_env("ENV_NAMESPACE", "prod");
            jail.set_env("ENV_GLOBAL_HOST_TAGS", "zone=b,cluster=c1");
            jail.set_env("ENV_GLOBAL_ELECTION_TAGS", "project=dk");

            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("env loads");

            assert_eq!(config.hostname, "node-7");
            assert_eq!(config.log_level, LogLevel::Warn);
            assert_eq!(
                config.dataway.urls,
                vec![
                    "https://a.example.com?token=t1",
                    "https://b.example.com?token=t2"
                ]
            );
            assert_eq!(config.dataway.timeout, Duration::from_secs(5));
            assert!(config.dataway.enable_httptrace);
            assert_eq!(config.io.feed_chan_size, 32);
            assert_eq!(config.io.max_cache_count, 10);
            assert_eq!(config.io.max_dynamic_cache_count, 20);
            assert_eq!(config.io.flush_interval, Duration::from_millis(500));
            assert!(config.io.enable_cache);
            assert_eq!(config.io.cache_max_bytes, 3 * GIB);
            assert!(!config.io.blocking_mode);
            assert!(config.election.enable);
            assert_eq!(config.election.namespace, "prod");
            assert_eq!(config.global_host_tags["zone"], "b");
            assert_eq!(config.global_host_tags["cluster"], "c1");
            assert_eq!(config.election.tags["project"], "dk");
            Ok(())
        });
    }

    #[test]
    fn test_filters_json_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(
                "ENV_IO_FILTERS",
                r#"{"logging":["{ source = 'nginx' and status in ['debug', 'info'] }"],"metric":["{ cpu > 95 }"]}"#,
            );
            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("env loads");
            assert_eq!(config.io.filters.len(), 2);
            assert_eq!(
                config.io.filters[&Category::Logging],
                vec!["{ source = 'nginx' and status in ['debug', 'info'] }"]
            );
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_sinks_from_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env(
                "ENV_SINK_M",
                "target=file,path=/tmp/m.json||target=http,url=http://127.0.0.1:9/m",
            );
            jail.set_env("ENV_SINK_CO", "target=file,path=/tmp/co.json");
            jail.set_env("ENV_SINK_XX", "target=file,path=/tmp/xx.json");
            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("env loads");

            assert_eq!(config.sinks.len(), 3);
            let co = config
                .sinks
                .iter()
                .find(|s| s.categories() == vec![Category::CustomObject])
                .expect("custom object sink");
            assert_eq!(co.get_str("path"), Some("/tmp/co.json"));
            let metric: Vec<_> = config
                .sinks
                .iter()
                .filter(|s| s.categories() == vec![Category::Metric])
                .collect();
            assert_eq!(metric.len(), 2);
            assert_eq!(metric[1].target(), Some("http"));
            Ok(())
        });
    }

    #[test]
    fn test_empty_env_keeps_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let mut config = Config::default();
            EnvConfigSource.load(&mut config).expect("env loads");
            assert_eq!(config, Config::default());
            Ok(())
        });
    }
}
