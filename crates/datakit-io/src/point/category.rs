// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed classification of telemetry. Selects the queue, the filter set and the
/// upstream path a point is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Category {
    Metric,
    Network,
    KeyEvent,
    Object,
    CustomObject,
    Logging,
    Tracing,
    Rum,
    Security,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Metric,
        Category::Network,
        Category::KeyEvent,
        Category::Object,
        Category::CustomObject,
        Category::Logging,
        Category::Tracing,
        Category::Rum,
        Category::Security,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Category::Metric => "metric",
            Category::Network => "network",
            Category::KeyEvent => "keyevent",
            Category::Object => "object",
            Category::CustomObject => "custom_object",
            Category::Logging => "logging",
            Category::Tracing => "tracing",
            Category::Rum => "rum",
            Category::Security => "security",
        }
    }

    /// Path appended to a Dataway base URL.
    #[must_use]
    pub const fn url_path(self) -> &'static str {
        match self {
            Category::Metric => "/v1/write/metric",
            Category::Network => "/v1/write/network",
            Category::KeyEvent => "/v1/write/keyevent",
            Category::Object => "/v1/write/object",
            Category::CustomObject => "/v1/write/custom_object",
            Category::Logging => "/v1/write/logging",
            Category::Tracing => "/v1/write/tracing",
            Category::Rum => "/v1/write/rum",
            Category::Security => "/v1/write/security",
        }
    }

    /// One or two letter form used by `ENV_SINK_<X>` and sink descriptors.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Category::Metric => "M",
            Category::Network => "N",
            Category::KeyEvent => "K",
            Category::Object => "O",
            Category::CustomObject => "CO",
            Category::Logging => "L",
            Category::Tracing => "T",
            Category::Rum => "R",
            Category::Security => "S",
        }
    }

    #[must_use]
    pub fn from_short_name(short: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.short_name().eq_ignore_ascii_case(short.trim()))
    }

    /// Object classes describe shared cluster resources and are only emitted by the
    /// elected leader.
    #[must_use]
    pub const fn is_singleton(self) -> bool {
        matches!(self, Category::Object | Category::CustomObject)
    }

    /// Inherently unbounded categories always use the dynamic lane.
    #[must_use]
    pub const fn is_dynamic(self) -> bool {
        matches!(self, Category::Logging | Category::Tracing | Category::Rum)
    }

    /// Only metric keys may contain dots.
    #[must_use]
    pub const fn allows_dotted_keys(self) -> bool {
        matches!(self, Category::Metric)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let normalized = normalized.trim_start_matches("/v1/write/");
        match normalized {
            "metric" | "metrics" => Ok(Category::Metric),
            "network" => Ok(Category::Network),
            "keyevent" | "key_event" => Ok(Category::KeyEvent),
            "object" => Ok(Category::Object),
            "custom_object" | "customobject" => Ok(Category::CustomObject),
            "logging" | "log" | "logs" => Ok(Category::Logging),
            "tracing" | "trace" | "traces" => Ok(Category::Tracing),
            "rum" => Ok(Category::Rum),
            "security" => Ok(Category::Security),
            _ => Self::from_short_name(s).ok_or_else(|| format!("unknown category: '{s}'")),
        }
    }
}

impl TryFrom<String> for Category {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Category> for &'static str {
    fn from(value: Category) -> Self {
        value.name()
    }
}
