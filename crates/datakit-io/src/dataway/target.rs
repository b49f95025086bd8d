// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::Url;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::dataway::DatawayError;
use crate::point::line_protocol::Precision;
use crate::point::Category;

const LOGFILTER_PATH: &str = "/v1/logfilter/pull";
const DATAKIT_HEARTBEAT_PATH: &str = "/v1/write/heartbeat";

/// One configured Dataway URL and its failure counters.
///
/// The query of the configured URL (usually `token=...`) is carried over to every
/// endpoint derived from it. Endpoint paths are absolute: a path in the configured URL
/// is not kept as a prefix.
#[derive(Debug)]
pub struct DatawayTarget {
    raw: String,
    base: Url,
    query: Vec<(String, String)>,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
}

impl DatawayTarget {
    pub fn parse(raw: &str) -> Result<Self, DatawayError> {
        let invalid = |message: String| DatawayError::InvalidUrl {
            url: raw.to_string(),
            message,
        };
        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        let query = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut base = url;
        base.set_query(None);
        base.set_fragment(None);
        base.set_path("");

        Ok(DatawayTarget {
            raw: raw.trim().to_string(),
            base,
            query,
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
        })
    }

    /// The URL as configured.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.as_str())
    }

    fn endpoint(&self, path: &str, extra: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.query {
                pairs.append_pair(k, v);
            }
            for (k, v) in extra {
                pairs.append_pair(k, v);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    /// `/v1/write/<category>` endpoint for a batch from `origin`.
    #[must_use]
    pub fn category_url(&self, category: Category, origin: &str, precision: Precision) -> Url {
        let mut extra = Vec::with_capacity(2);
        if !origin.is_empty() {
            extra.push(("input", origin));
        }
        if precision != Precision::Ns {
            extra.push(("precision", precision.as_str()));
        }
        self.endpoint(category.url_path(), &extra)
    }

    /// Endpoint used when the configured URL is a Dataway proxy.
    #[must_use]
    pub fn proxy_url(&self, category: Category) -> Url {
        self.endpoint("/proxy", &[("category", category.url_path())])
    }

    /// Logging filters maintained on the workspace side.
    #[must_use]
    pub fn logfilter_url(&self) -> Url {
        self.endpoint(LOGFILTER_PATH, &[])
    }

    /// Agent liveness report, optionally through a Dataway proxy.
    #[must_use]
    pub fn datakit_heartbeat_url(&self, proxy: bool) -> Url {
        if proxy {
            self.endpoint("/proxy", &[("category", DATAKIT_HEARTBEAT_PATH)])
        } else {
            self.endpoint(DATAKIT_HEARTBEAT_PATH, &[])
        }
    }

    #[must_use]
    pub fn election_url(&self, namespace: &str, id: &str) -> Url {
        self.endpoint("/v1/election", &[("namespace", namespace), ("id", id)])
    }

    #[must_use]
    pub fn heartbeat_url(&self, namespace: &str, id: &str) -> Url {
        self.endpoint(
            "/v1/election/heartbeat",
            &[("namespace", namespace), ("id", id)],
        )
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Batches failed in a row since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }
}
