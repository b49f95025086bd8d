// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `self` input: reports the pipeline's own counters as `datakit` metric points.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::inputs::Input;
use crate::io::{FeedOptions, Io};
use crate::point::{Category, Point, PointError};
use crate::stats::StatsSnapshot;

pub const NAME: &str = "self";
pub const MEASUREMENT: &str = "datakit";

#[derive(Debug, Clone)]
pub struct SelfInput {
    interval: Duration,
}

impl SelfInput {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        SelfInput { interval }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.io.flush_interval)
    }

    /// One point per category, plus one for the feed channel and the cache.
    pub fn points(snapshot: &StatsSnapshot) -> Result<Vec<Point>, PointError> {
        let mut points = Vec::with_capacity(snapshot.categories.len() + 1);
        for (category, c) in &snapshot.categories {
            points.push(
                Point::builder(MEASUREMENT)
                    .tag("category", category.name())
                    .field("fed", c.fed)
                    .field("queued", c.queued)
                    .field("filtered", c.filtered)
                    .field("invalid", c.invalid)
                    .field("election_suppressed", c.election_suppressed)
                    .field("dropped", c.dropped)
                    .field("cached", c.cached)
                    .field("cache_evicted", c.cache_evicted)
                    .field("delivered", c.delivered)
                    .field("failed", c.failed)
                    .field("sink_failures", c.sink_failures)
                    .field("shutdown_lost", c.shutdown_lost)
                    .build()?,
            );
        }
        points.push(
            Point::builder(MEASUREMENT)
                .tag("category", "all")
                .field("feed_chan_len", snapshot.feed_chan.len)
                .field("feed_chan_cap", snapshot.feed_chan.cap)
                .field("cache_corrupt_segments", snapshot.cache_corrupt_segments)
                .field("inputs", snapshot.inputs.len())
                .build()?,
        );
        Ok(points)
    }
}

#[async_trait]
impl Input for SelfInput {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, io: Io, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and would report all zeros.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let start = Instant::now();
            let points = match Self::points(&io.stats()) {
                Ok(points) => points,
                Err(e) => {
                    io.feed_last_error(NAME, &e.to_string());
                    continue;
                }
            };
            let opts = FeedOptions {
                cost: Some(start.elapsed()),
                ..FeedOptions::default()
            };
            if let Err(e) = io.feed(NAME, Category::Metric, points, opts).await {
                debug!("INPUT | {} feed failed: {}", NAME, e);
            }
        }
        debug!("INPUT | {} stopped", NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::FieldValue;
    use crate::stats::{CategorySnapshot, ChanStat};

    #[test]
    fn test_points_from_snapshot() {
        let mut snapshot = StatsSnapshot {
            feed_chan: ChanStat { len: 3, cap: 128 },
            ..StatsSnapshot::default()
        };
        snapshot.categories.insert(
            Category::Logging,
            CategorySnapshot {
                fed: 10,
                dropped: 4,
                ..CategorySnapshot::default()
            },
        );

        let points = SelfInput::points(&snapshot).expect("points");
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].measurement(), MEASUREMENT);
        assert_eq!(points[0].tag("category"), Some("logging"));
        assert_eq!(points[0].field("dropped"), Some(&FieldValue::Int(4)));
        assert_eq!(points[1].field("feed_chan_cap"), Some(&FieldValue::Int(128)));
    }
}
