// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `target = "http"`: POSTs each batch as a JSON array to `url`.
//!
//! Optional keys: `timeout` (human duration, default 10s) and `headers` (a table, or a
//! `k:v;k:v` string when the descriptor came from the environment).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::point::{Category, Point};
use crate::sink::{JsonPoint, Sink, SinkDescriptor, SinkError};

pub const TARGET: &str = "http";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct HttpSink {
    id: String,
    url: Url,
    categories: Vec<Category>,
    client: reqwest::Client,
    headers: HeaderMap,
}

fn parse_headers(value: Option<&Value>) -> HeaderMap {
    let pairs: Vec<(String, String)> = match value {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let v = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                (k.clone(), v)
            })
            .collect(),
        Some(Value::String(s)) => s
            .split(';')
            .filter_map(|p| p.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect(),
        _ => Vec::new(),
    };

    let mut headers = HeaderMap::new();
    for (k, v) in pairs {
        match (HeaderName::try_from(k.as_str()), HeaderValue::try_from(v.as_str())) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!("SINK | Invalid header '{}' for http sink, ignoring", k),
        }
    }
    headers
}

impl HttpSink {
    pub fn new(
        url: Url,
        categories: Vec<Category>,
        timeout: Duration,
        headers: HeaderMap,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::user_agent())
            .build()
            .map_err(|e| SinkError::Http(e.to_string()))?;
        Ok(HttpSink {
            id: format!("{TARGET}:{url}"),
            url,
            categories,
            client,
            headers,
        })
    }

    pub fn create(descriptor: &SinkDescriptor) -> Result<Arc<dyn Sink>, SinkError> {
        let raw = descriptor
            .get_str("url")
            .ok_or_else(|| SinkError::InvalidDescriptor("http sink requires 'url'".to_string()))?;
        let url = Url::parse(raw.trim())
            .map_err(|e| SinkError::InvalidDescriptor(format!("invalid url '{raw}': {e}")))?;

        let timeout = match descriptor.get_str("timeout") {
            Some(t) => humantime_serde::re::humantime::parse_duration(t.trim()).map_err(|e| {
                SinkError::InvalidDescriptor(format!("invalid timeout '{t}': {e}"))
            })?,
            None => DEFAULT_TIMEOUT,
        };

        let headers = parse_headers(descriptor.get("headers"));
        Ok(Arc::new(HttpSink::new(
            url,
            descriptor.categories(),
            timeout,
            headers,
        )?))
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn categories(&self) -> &[Category] {
        &self.categories
    }

    async fn write(&self, category: Category, points: &[Point]) -> Result<(), SinkError> {
        let body: Vec<JsonPoint<'_>> = points.iter().map(JsonPoint::from).collect();
        let resp = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .query(&[("category", category.name())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Http(format!("{} responded {}", self.url, status)))
        }
    }
}
