// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared HTTP client construction for Dataway targets, the election candidate and
//! HTTP sinks.
//!
//! An invalid proxy is logged and the client falls back to a direct connection, so a
//! typo in `http_proxy` never stops delivery altogether.

use core::time::Duration;
use std::error::Error;
use tracing::error;

use crate::config::DatawayConfig;

#[must_use]
pub fn get_client(config: &DatawayConfig) -> reqwest::Client {
    match build_client_inner(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "DATAWAY | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client_inner(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "DATAWAY | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client_inner(
    config: &DatawayConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(crate::user_agent())
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if config.max_idle_conns_per_host > 0 {
        client = client.pool_max_idle_per_host(config.max_idle_conns_per_host);
    }

    if allow_proxy {
        if let Some(proxy) = &config.http_proxy {
            client = client.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
    }

    Ok(client.build()?)
}
