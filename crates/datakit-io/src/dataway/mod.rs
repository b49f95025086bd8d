// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dataway client.
//!
//! A batch is encoded once (line protocol, optionally gzip) and posted to every
//! configured target concurrently. Each target retries on its own according to the
//! [`RetryStrategy`]; the batch counts as delivered when at least one target accepted it.
//!
//! Any non-2xx response is a failure and is retried the same way as a transport error.

pub mod heartbeat;
pub mod target;

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use futures::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::DatawayConfig;
use crate::http::get_client;
use crate::point::line_protocol::{self, Precision};
use crate::point::Batch;
pub use target::DatawayTarget;

/// Consecutive failed batches after which a target is considered down.
pub const MAX_SEND_FAIL_COUNT: u32 = 16;

pub const HEADER_POINTS: &str = "X-Datakit-Points";
pub const HEADER_ATTEMPT: &str = "X-Datakit-Attempt";
pub const HEADER_ORIGIN: &str = "X-Datakit-Origin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Immediate(usize),
    /// Attempts, then the base delay in milliseconds; the n-th retry waits n times the
    /// base.
    LinearBackoff(usize, u64),
}

impl RetryStrategy {
    #[must_use]
    pub fn attempts(&self) -> usize {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => (*n).max(1),
        }
    }

    /// Pause before attempt number `attempt + 1`.
    #[must_use]
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, ms) => {
                Duration::from_millis(ms.saturating_mul(attempt as u64))
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("dataway responded {code}: {body}")]
    Status { code: u16, body: String },
    #[error("failed to build request: {0}")]
    Build(String),
    #[error("delivery aborted")]
    Aborted,
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum DatawayError {
    #[error("invalid dataway url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error("no dataway url configured")]
    NoTargets,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetOutcome {
    pub url: String,
    pub attempts: usize,
    pub result: Result<(), SendError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub outcomes: Vec<TargetOutcome>,
}

impl DeliveryReport {
    /// At least one target accepted the batch.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.outcomes.iter().any(|o| o.result.is_ok())
    }

    #[must_use]
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && !self.delivered()
    }

    #[must_use]
    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

#[derive(Clone, Debug)]
pub struct Dataway {
    client: reqwest::Client,
    targets: Arc<[DatawayTarget]>,
    retry_strategy: RetryStrategy,
    gzip: bool,
    precision: Precision,
    proxy_mode: bool,
    http_trace: bool,
    extra_headers: HeaderMap,
}

impl Dataway {
    pub fn new(config: &DatawayConfig) -> Result<Self, DatawayError> {
        let targets = config
            .urls
            .iter()
            .map(|u| DatawayTarget::parse(u))
            .collect::<Result<Vec<_>, _>>()?;
        if targets.is_empty() {
            return Err(DatawayError::NoTargets);
        }

        let mut extra_headers = HeaderMap::new();
        for (k, v) in &config.extra_headers {
            match (HeaderName::try_from(k.as_str()), HeaderValue::try_from(v.as_str())) {
                (Ok(name), Ok(value)) => {
                    extra_headers.insert(name, value);
                }
                _ => error!("DATAWAY | Invalid extra header '{}', ignoring", k),
            }
        }

        let retry_strategy = if config.retry_backoff.is_zero() {
            RetryStrategy::Immediate(config.retry_count)
        } else {
            RetryStrategy::LinearBackoff(
                config.retry_count,
                u64::try_from(config.retry_backoff.as_millis()).unwrap_or(u64::MAX),
            )
        };

        Ok(Dataway {
            client: get_client(config),
            targets: targets.into(),
            retry_strategy,
            gzip: config.gzip,
            precision: config.precision,
            proxy_mode: config.proxy_mode,
            http_trace: config.enable_httptrace,
            extra_headers,
        })
    }

    #[must_use]
    pub fn targets(&self) -> &[DatawayTarget] {
        &self.targets
    }

    /// Consecutive failed batches of the target configured as `url`.
    #[must_use]
    pub fn send_fail_count(&self, url: &str) -> Option<u32> {
        self.targets
            .iter()
            .find(|t| t.url() == url.trim())
            .map(DatawayTarget::consecutive_failures)
    }

    /// Every target has failed at least `max` batches in a row.
    #[must_use]
    pub fn should_throttle(&self, max: u32) -> bool {
        max > 0 && self.targets.iter().all(|t| t.consecutive_failures() >= max)
    }

    fn encode(&self, batch: &Batch) -> Result<Bytes, SendError> {
        let body = line_protocol::encode(&batch.points, self.precision);
        if !self.gzip {
            return Ok(Bytes::from(body));
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| SendError::Build(e.to_string()))?;
        encoder
            .finish()
            .map(Bytes::from)
            .map_err(|e| SendError::Build(e.to_string()))
    }

    /// Posts `batch` to every target. `abort` interrupts in-flight requests and backoff.
    pub async fn send(&self, batch: &Batch, abort: &CancellationToken) -> DeliveryReport {
        if batch.is_empty() {
            return DeliveryReport::default();
        }
        let body = match self.encode(batch) {
            Ok(body) => body,
            Err(e) => {
                error!("DATAWAY | Failed to encode {} batch: {}", batch.category, e);
                return DeliveryReport {
                    outcomes: self
                        .targets
                        .iter()
                        .map(|t| TargetOutcome {
                            url: t.url().to_string(),
                            attempts: 0,
                            result: Err(e.clone()),
                        })
                        .collect(),
                };
            }
        };

        let sends = self
            .targets
            .iter()
            .map(|target| self.send_to(target, batch, body.clone(), abort));
        DeliveryReport {
            outcomes: join_all(sends).await,
        }
    }

    async fn send_to(
        &self,
        target: &DatawayTarget,
        batch: &Batch,
        body: Bytes,
        abort: &CancellationToken,
    ) -> TargetOutcome {
        let url = if self.proxy_mode {
            target.proxy_url(batch.category)
        } else {
            target.category_url(batch.category, &batch.origin, self.precision)
        };

        let max_attempts = self.retry_strategy.attempts();
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let time = Instant::now();
            let result = tokio::select! {
                biased;
                () = abort.cancelled() => Err(SendError::Aborted),
                r = self.post(url.clone(), batch, body.clone(), attempts) => r,
            };
            let elapsed = time.elapsed();

            match result {
                Ok(()) => {
                    if self.http_trace {
                        debug!(
                            "DATAWAY | {} points of {} to {} in {} ms (attempt {})",
                            batch.len(),
                            batch.category,
                            target.url(),
                            elapsed.as_millis(),
                            attempts
                        );
                    }
                    break Ok(());
                }
                Err(SendError::Aborted) => break Err(SendError::Aborted),
                Err(e) if attempts >= max_attempts => {
                    error!(
                        "DATAWAY | Failed to send {} points of {} after {} ms and {} attempts: {}",
                        batch.len(),
                        batch.category,
                        elapsed.as_millis(),
                        attempts,
                        e
                    );
                    break Err(e);
                }
                Err(e) => {
                    warn!(
                        "DATAWAY | Attempt {} for {} failed: {}, retrying",
                        attempts, batch.category, e
                    );
                    let delay = self.retry_strategy.delay(attempts);
                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            () = abort.cancelled() => break Err(SendError::Aborted),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };

        match &result {
            Ok(()) => target.record_success(),
            Err(SendError::Aborted) => {}
            Err(_) => target.record_failure(),
        }

        TargetOutcome {
            url: target.url().to_string(),
            attempts,
            result,
        }
    }

    async fn post(
        &self,
        url: Url,
        batch: &Batch,
        body: Bytes,
        attempt: usize,
    ) -> Result<(), SendError> {
        let mut req = self
            .client
            .post(url)
            .headers(self.extra_headers.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if self.gzip {
            req = req.header(CONTENT_ENCODING, "gzip");
        }
        if self.http_trace {
            req = req
                .header(HEADER_POINTS, batch.len())
                .header(HEADER_ATTEMPT, attempt)
                .header(HEADER_ORIGIN, batch.origin.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        Err(SendError::Status {
            code: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }

    /// Fetches the logging filter conditions from the first target.
    pub async fn pull_log_filters(&self) -> Result<Vec<String>, SendError> {
        let target = self
            .targets
            .first()
            .ok_or_else(|| SendError::Build("no dataway target".to_string()))?;
        let resp = self
            .client
            .get(target.logfilter_url())
            .headers(self.extra_headers.clone())
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(SendError::Status {
                code: status.as_u16(),
                body,
            });
        }
        parse_log_filters(&body)
    }

    /// Reports the agent alive to every target. Failures are logged, never retried.
    pub async fn heartbeat(&self, id: &str, host: &str) -> DeliveryReport {
        let body = serde_json::json!({
            "dk_uuid": id,
            "heartbeat": crate::point::now_nanos() / 1_000_000_000,
            "host": host,
        });
        let posts = self.targets.iter().map(|target| {
            let body = &body;
            async move {
                let result = self
                    .client
                    .post(target.datakit_heartbeat_url(self.proxy_mode))
                    .headers(self.extra_headers.clone())
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| SendError::Transport(e.to_string()));
                let result = match result {
                    Ok(resp) if resp.status().as_u16() < 400 => Ok(()),
                    Ok(resp) => Err(SendError::Status {
                        code: resp.status().as_u16(),
                        body: resp.text().await.unwrap_or_default(),
                    }),
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    warn!("DATAWAY | Heartbeat to {} failed: {}", target.url(), e);
                }
                TargetOutcome {
                    url: target.url().to_string(),
                    attempts: 1,
                    result,
                }
            }
        });
        DeliveryReport {
            outcomes: join_all(posts).await,
        }
    }

    /// Empty POST to a control endpoint (election, heartbeat), returning the body.
    pub(crate) async fn post_control(&self, url: Url) -> Result<String, SendError> {
        let resp = self
            .client
            .post(url)
            .headers(self.extra_headers.clone())
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(SendError::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogFilterResponse {
    #[serde(default)]
    content: Vec<String>,
}

/// `{"content": ["{ source = 'nginx' }", ...]}`; blank conditions are dropped.
fn parse_log_filters(body: &str) -> Result<Vec<String>, SendError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let resp: LogFilterResponse =
        serde_json::from_str(body).map_err(|e| SendError::Decode(format!("{e}: {body}")))?;
    Ok(resp
        .content
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{Category, Point};
    use flate2::read::GzDecoder;
    use mockito::Matcher;
    use std::io::Read;

    fn config(urls: Vec<String>) -> DatawayConfig {
        DatawayConfig {
            urls,
            retry_backoff: Duration::from_millis(1),
            ..DatawayConfig::default()
        }
    }

    fn batch(n: i64) -> Batch {
        let points = (0..n)
            .map(|i| {
                Point::builder("cpu")
                    .tag("host", "h1")
                    .field("usage", i)
                    .time_nanos(1_000 + i)
                    .build()
                    .expect("valid point")
            })
            .collect();
        Batch::new(Category::Metric, "cpu", points)
    }

    #[test]
    fn test_retry_strategy() {
        let s = RetryStrategy::LinearBackoff(3, 200);
        assert_eq!(s.attempts(), 3);
        assert_eq!(s.delay(1), Duration::from_millis(200));
        assert_eq!(s.delay(2), Duration::from_millis(400));
        assert_eq!(RetryStrategy::Immediate(0).attempts(), 1);
        assert_eq!(RetryStrategy::Immediate(2).delay(5), Duration::ZERO);
    }

    #[test]
    fn test_new_requires_a_valid_target() {
        assert_eq!(
            Dataway::new(&config(vec![])).expect_err("no targets"),
            DatawayError::NoTargets
        );
        assert!(matches!(
            Dataway::new(&config(vec!["nope".to_string()])),
            Err(DatawayError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_gzipped_line_protocol() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/write/metric")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("token".into(), "tkn_1".into()),
                Matcher::UrlEncoded("input".into(), "cpu".into()),
            ]))
            .match_header("content-encoding", "gzip")
            .with_status(200)
            .create_async()
            .await;

        let dataway =
            Dataway::new(&config(vec![format!("{}?token=tkn_1", server.url())])).expect("dataway");
        let report = dataway.send(&batch(2), &CancellationToken::new()).await;

        assert!(report.delivered());
        assert_eq!(report.outcomes[0].attempts, 1);
        mock.assert_async().await;
    }

    #[test]
    fn test_encode_gzip_round_trips() {
        let dataway = Dataway::new(&config(vec!["http://localhost:9528".to_string()]))
            .expect("dataway");
        let body = dataway.encode(&batch(1)).expect("encode");
        let mut decoded = String::new();
        GzDecoder::new(&body[..])
            .read_to_string(&mut decoded)
            .expect("gunzip");
        assert_eq!(decoded, "cpu,host=h1 usage=0i 1000\n");
    }

    #[tokio::test]
    async fn test_non_2xx_is_retried_then_counted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/write/metric")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body("bad point")
            .expect(3)
            .create_async()
            .await;

        let dataway = Dataway::new(&config(vec![server.url()])).expect("dataway");
        let report = dataway.send(&batch(1), &CancellationToken::new()).await;

        assert!(report.all_failed());
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(
            report.outcomes[0].result,
            Err(SendError::Status {
                code: 400,
                body: "bad point".to_string()
            })
        );
        assert_eq!(dataway.send_fail_count(&server.url()), Some(1));
        assert!(dataway.should_throttle(1));
        assert!(!dataway.should_throttle(2));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_one_healthy_target_is_enough() {
        let mut up = mockito::Server::new_async().await;
        let mut down = mockito::Server::new_async().await;
        let up_mock = up
            .mock("POST", "/v1/write/metric")
            .match_query(Matcher::Any)
            .with_status(202)
            .create_async()
            .await;
        let down_mock = down
            .mock("POST", "/v1/write/metric")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let dataway = Dataway::new(&config(vec![up.url(), down.url()])).expect("dataway");
        let report = dataway.send(&batch(1), &CancellationToken::new()).await;

        assert!(report.delivered());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(dataway.send_fail_count(&up.url()), Some(0));
        assert_eq!(dataway.send_fail_count(&down.url()), Some(1));
        assert!(!dataway.should_throttle(1));
        up_mock.assert_async().await;
        down_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_trace_and_proxy_mode() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/proxy")
            .match_query(Matcher::UrlEncoded(
                "category".into(),
                "/v1/write/metric".into(),
            ))
            .match_header(HEADER_POINTS, "3")
            .match_header(HEADER_ATTEMPT, "1")
            .match_header(HEADER_ORIGIN, "cpu")
            .with_status(200)
            .create_async()
            .await;

        let mut cfg = config(vec![server.url()]);
        cfg.proxy_mode = true;
        cfg.enable_httptrace = true;
        cfg.gzip = false;
        let dataway = Dataway::new(&cfg).expect("dataway");
        assert!(dataway.send(&batch(3), &CancellationToken::new()).await.delivered());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_abort_stops_retrying() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/write/metric")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let mut cfg = config(vec![server.url()]);
        cfg.retry_count = 100;
        cfg.retry_backoff = Duration::from_secs(60);
        let dataway = Dataway::new(&cfg).expect("dataway");
        let abort = CancellationToken::new();
        let cancel = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let report = dataway.send(&batch(1), &abort).await;
        assert_eq!(report.outcomes[0].result, Err(SendError::Aborted));
        assert_eq!(dataway.send_fail_count(&server.url()), Some(0));
    }

    #[tokio::test]
    async fn test_pull_log_filters_from_first_target() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/logfilter/pull")
            .match_query(Matcher::UrlEncoded("token".into(), "tkn_1".into()))
            .with_status(200)
            .with_body(r#"{"content":["{ source = 'nginx' }", " ", "{ level = 'debug' }"]}"#)
            .create_async()
            .await;

        let dataway = Dataway::new(&config(vec![
            format!("{}?token=tkn_1", server.url()),
            "http://127.0.0.1:1".to_string(),
        ]))
        .expect("dataway");
        let rules = dataway.pull_log_filters().await.expect("pulled");
        assert_eq!(rules, vec!["{ source = 'nginx' }", "{ level = 'debug' }"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pull_log_filters_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/logfilter/pull")
            .with_status(403)
            .with_body("bad token")
            .create_async()
            .await;
        let dataway = Dataway::new(&config(vec![server.url()])).expect("dataway");
        assert_eq!(
            dataway.pull_log_filters().await,
            Err(SendError::Status {
                code: 403,
                body: "bad token".to_string()
            })
        );

        assert!(matches!(
            parse_log_filters("not json"),
            Err(SendError::Decode(_))
        ));
        assert_eq!(parse_log_filters(""), Ok(Vec::new()));
        assert_eq!(parse_log_filters("{}"), Ok(Vec::new()));
    }

    #[tokio::test]
    async fn test_heartbeat_posts_to_every_target() {
        let mut up = mockito::Server::new_async().await;
        let mut down = mockito::Server::new_async().await;
        let up_mock = up
            .mock("POST", "/v1/write/heartbeat")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "dk_uuid": "dkid_1",
                "host": "node-1",
            })))
            .with_status(200)
            .create_async()
            .await;
        let down_mock = down
            .mock("POST", "/v1/write/heartbeat")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let dataway = Dataway::new(&config(vec![up.url(), down.url()])).expect("dataway");
        let report = dataway.heartbeat("dkid_1", "node-1").await;
        assert!(report.delivered());
        assert_eq!(report.failures().count(), 1);
        // Heartbeats do not count against batch delivery.
        assert_eq!(dataway.send_fail_count(&down.url()), Some(0));
        up_mock.assert_async().await;
        down_mock.assert_async().await;
    }
}
