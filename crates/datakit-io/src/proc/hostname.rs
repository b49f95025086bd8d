// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host identity detection.

use std::env;
use tracing::warn;

pub const HOSTNAME_ENV: &str = "ENV_HOSTNAME";

/// Resolve the identity stamped into every point's `host` tag.
///
/// Order of precedence:
/// 1. `ENV_HOSTNAME` (explicit operator override)
/// 2. the system hostname
/// 3. `"unknown"`
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var(HOSTNAME_ENV) {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    match hostname::get() {
        Ok(name) => match name.to_str() {
            Some(name) if !name.is_empty() => return name.to_string(),
            Some(_) => warn!("System hostname is empty"),
            None => warn!("System hostname is not valid UTF-8"),
        },
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
