// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion gateway.
//!
//! [`Io`] is the cheap, cloneable handle every producer writes through. A feed is
//! tagged, filtered and then reserves room in its category queue before it is handed
//! to the feed channel; the [`IoService`] dispatcher moves items from that channel into
//! the queues, and one [`Batcher`] per category drains them.
//!
//! Points that do not fit are spilled to the disk cache when it is enabled, waited for
//! in blocking mode, or dropped and reported as [`FeedError::QueueFull`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batcher::{Batcher, Outputs};
use crate::cache::{CacheEntry, CacheError, DiskCache};
use crate::config::{Config, ConfigError};
use crate::dataway::{Dataway, DatawayError};
use crate::election::{ElectionState, TagInjector};
use crate::filter::{FilterError, Filters};
use crate::point::{Category, Measurement, Point};
use crate::queue::{CategoryQueue, Lane};
use crate::sink::{SinkRegistry, SinkRouter};
use crate::stats::{ChanStat, Stats, StatsSnapshot};

/// Per-call hints supplied by the producer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// Time the producer spent collecting this feed.
    pub cost: Option<Duration>,
    /// Route through the dynamic lane.
    pub high_freq: bool,
    /// Treat the points as cluster-singleton regardless of category.
    pub election: bool,
    /// Wake the category's batcher right away.
    pub flush_now: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("feed carries no points")]
    NoPoints,
    #[error("{category} queue full, {dropped} points dropped")]
    QueueFull { category: Category, dropped: usize },
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Dataway(#[from] DatawayError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug)]
struct FeedItem {
    category: Category,
    lane: Lane,
    origin: Arc<str>,
    points: Vec<Point>,
}

/// Producer-facing handle.
#[derive(Clone, Debug)]
pub struct Io {
    tx: mpsc::Sender<FeedItem>,
    queues: Arc<[Arc<CategoryQueue>]>,
    filters: Filters,
    injector: Arc<TagInjector>,
    cache: Option<Arc<DiskCache>>,
    blocking: bool,
    stats: Arc<Stats>,
    cancel: CancellationToken,
}

impl Io {
    /// Tags, filters and queues `points`. All points must belong to `category`.
    ///
    /// Only blocking mode waits for queue space; otherwise the call returns as soon as
    /// the points are queued, cached or dropped.
    pub async fn feed(
        &self,
        origin: &str,
        category: Category,
        mut points: Vec<Point>,
        opts: FeedOptions,
    ) -> Result<(), FeedError> {
        if points.is_empty() {
            return Err(FeedError::NoPoints);
        }
        if self.cancel.is_cancelled() {
            return Err(FeedError::ShuttingDown);
        }

        let counters = self.stats.category(category);
        self.stats
            .record_feed(origin, category, points.len(), opts.cost);
        Stats::add(&counters.fed, points.len());

        if !self.injector.admits(category, opts.election) {
            trace!(
                "IO | not leader, suppressing {} {} points from {}",
                points.len(),
                category,
                origin
            );
            Stats::add(&counters.election_suppressed, points.len());
            return Ok(());
        }
        for point in &mut points {
            self.injector.inject(category, opts.election, point);
        }
        let before = points.len();
        points.retain(|p| match p.validate(category) {
            Ok(()) => true,
            Err(e) => {
                warn!("IO | {} fed an invalid {} point: {}", origin, category, e);
                self.stats.record_error(origin, &e.to_string());
                false
            }
        });
        Stats::add(&counters.invalid, before - points.len());

        let filters = self.filters.current();
        Stats::add(&counters.filtered, filters.apply(category, &mut points));
        if points.is_empty() {
            return Ok(());
        }

        let queue = &self.queues[category.index()];
        let lane = queue.lane_for(opts.high_freq);
        let origin: Arc<str> = Arc::from(origin);
        let reserved = queue.try_reserve(lane, points.len());
        let overflow = points.split_off(reserved);

        if !points.is_empty() {
            if let Err(e) = self.hand_off(category, lane, &origin, points).await {
                Stats::add(&counters.shutdown_lost, overflow.len());
                return Err(e);
            }
        }
        let result = if overflow.is_empty() {
            Ok(())
        } else {
            self.overflow(category, lane, &origin, overflow).await
        };

        if opts.flush_now {
            queue.request_flush();
        }
        result
    }

    /// Converts each measurement and feeds the result. Measurements that fail to
    /// convert are skipped and recorded as the origin's last error.
    pub async fn feed_measurement<M: Measurement>(
        &self,
        origin: &str,
        category: Category,
        measurements: &[M],
        opts: FeedOptions,
    ) -> Result<(), FeedError> {
        let mut points = Vec::with_capacity(measurements.len());
        for measurement in measurements {
            match measurement.to_point() {
                Ok(point) => points.push(point),
                Err(e) => {
                    warn!("IO | {} produced an invalid {} point: {}", origin, category, e);
                    self.stats.record_error(origin, &e.to_string());
                }
            }
        }
        self.feed(origin, category, points, opts).await
    }

    /// Active filters; the log filter pull updates them in place.
    #[must_use]
    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    pub fn feed_last_error(&self, origin: &str, message: &str) {
        debug!("IO | {} reported: {}", origin, message);
        self.stats.record_error(origin, message);
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let cap = self.tx.max_capacity();
        self.stats.snapshot(ChanStat {
            len: cap.saturating_sub(self.tx.capacity()),
            cap,
        })
    }

    /// Wakes the batcher of `category` ahead of its next tick.
    pub fn flush(&self, category: Category) {
        self.queues[category.index()].request_flush();
    }

    /// Points currently buffered in memory for `category`.
    #[must_use]
    pub fn queued(&self, category: Category) -> usize {
        self.queues[category.index()].len()
    }

    async fn hand_off(
        &self,
        category: Category,
        lane: Lane,
        origin: &Arc<str>,
        points: Vec<Point>,
    ) -> Result<(), FeedError> {
        let counters = self.stats.category(category);
        let n = points.len();
        let item = FeedItem {
            category,
            lane,
            origin: Arc::clone(origin),
            points,
        };
        let sent = tokio::select! {
            biased;
            r = self.tx.send(item) => r.is_ok(),
            () = self.cancel.cancelled() => false,
        };
        if sent {
            Stats::add(&counters.queued, n);
            Ok(())
        } else {
            self.queues[category.index()].release(lane, n);
            Stats::add(&counters.shutdown_lost, n);
            Err(FeedError::ShuttingDown)
        }
    }

    async fn overflow(
        &self,
        category: Category,
        lane: Lane,
        origin: &Arc<str>,
        mut points: Vec<Point>,
    ) -> Result<(), FeedError> {
        let counters = self.stats.category(category);
        let queue = &self.queues[category.index()];

        if let Some(cache) = &self.cache {
            let n = points.len();
            debug!(
                "IO | {} {} lane full, spilling {} points from {} to the cache",
                category,
                if lane == Lane::Static { "static" } else { "dynamic" },
                n,
                origin
            );
            return match cache
                .put_async(CacheEntry::new(category, origin.as_ref(), points))
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("CACHE | failed to spill {} points of {}: {}", n, category, e);
                    Stats::add(&counters.dropped, n);
                    Err(FeedError::QueueFull {
                        category,
                        dropped: n,
                    })
                }
            };
        }

        if self.blocking && queue.capacity(lane) > 0 {
            while !points.is_empty() {
                let got = tokio::select! {
                    n = queue.reserve(lane, points.len()) => n,
                    () = self.cancel.cancelled() => 0,
                };
                if got == 0 {
                    Stats::add(&counters.shutdown_lost, points.len());
                    return Err(FeedError::ShuttingDown);
                }
                let rest = points.split_off(got);
                if let Err(e) = self.hand_off(category, lane, origin, points).await {
                    Stats::add(&counters.shutdown_lost, rest.len());
                    return Err(e);
                }
                points = rest;
            }
            return Ok(());
        }

        let dropped = points.len();
        debug!(
            "IO | {} queue full, dropping {} points from {}",
            category, dropped, origin
        );
        Stats::add(&counters.dropped, dropped);
        Err(FeedError::QueueFull { category, dropped })
    }
}

impl Outputs {
    /// Builds the Dataway client, the disk cache and the sinks `config` asks for.
    pub fn from_config(
        config: &Config,
        registry: &SinkRegistry,
        stats: Arc<Stats>,
    ) -> Result<Self, IoError> {
        let mut outputs = Outputs::new(Arc::clone(&stats)).with_sinks(
            SinkRouter::from_descriptors(registry, &config.sinks, Arc::clone(&stats)),
        );
        if config.dataway.urls.is_empty() {
            warn!("IO | no dataway configured, points only reach sinks");
        } else {
            outputs = outputs.with_dataway(Dataway::new(&config.dataway)?);
        }
        if config.io.enable_cache {
            let (cache, _) =
                DiskCache::open(config.io.cache_dir.clone(), config.io.cache_max_bytes, stats)?;
            outputs = outputs.with_cache(Arc::new(cache));
        }
        Ok(outputs)
    }
}

/// Owns the feed channel receiver and the batchers.
pub struct IoService {
    rx: mpsc::Receiver<FeedItem>,
    queues: Arc<[Arc<CategoryQueue>]>,
    batchers: Vec<Batcher>,
    grace: Duration,
    abort: CancellationToken,
    cancel: CancellationToken,
}

impl IoService {
    /// Builds the pipeline. Nothing runs until [`IoService::run`] is awaited; `cancel`
    /// stops ingestion and triggers the final flush.
    pub fn new(
        config: Arc<Config>,
        outputs: Outputs,
        election: ElectionState,
        cancel: CancellationToken,
    ) -> Result<(Self, Io), IoError> {
        config.validate()?;
        let filters = Filters::new(config.io.filters.clone())?;

        let queues: Arc<[Arc<CategoryQueue>]> = Category::ALL
            .iter()
            .map(|c| {
                Arc::new(CategoryQueue::new(
                    *c,
                    config.io.max_cache_count,
                    config.io.max_dynamic_cache_count,
                    config.io.max_batch_points,
                ))
            })
            .collect();

        let abort = CancellationToken::new();
        let batchers = queues
            .iter()
            .map(|q| Batcher::new(Arc::clone(q), outputs.clone(), &config, abort.clone()))
            .collect();

        let (tx, rx) = mpsc::channel(config.io.feed_chan_size);
        let io = Io {
            tx,
            queues: Arc::clone(&queues),
            filters,
            injector: Arc::new(TagInjector::new(&config, election)),
            cache: outputs.cache.clone(),
            blocking: config.io.blocking_mode,
            stats: outputs.stats,
            cancel: cancel.clone(),
        };

        let service = IoService {
            rx,
            queues,
            batchers,
            grace: config.io.flush_grace_period,
            abort,
            cancel,
        };
        Ok((service, io))
    }

    fn push(&self, item: FeedItem) {
        self.queues[item.category.index()].push(item.lane, &item.origin, item.points);
    }

    /// Moves feed items into their queues until shutdown, then drains what is left in
    /// the channel.
    async fn dispatch(&mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => self.push(item),
                    None => break,
                },
            }
        }
        self.rx.close();
        while let Some(item) = self.rx.recv().await {
            self.push(item);
        }
    }

    /// Runs until the cancellation token fires or every [`Io`] handle is dropped. The
    /// batchers then get one final flush bounded by the grace period.
    pub async fn run(mut self) {
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();
        for batcher in std::mem::take(&mut self.batchers) {
            workers.spawn(batcher.run(stop.clone()));
        }
        info!("IO | pipeline started");

        self.dispatch().await;
        stop.cancel();

        let finished = tokio::time::timeout(self.grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("IO | batcher failed: {}", e);
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                "IO | flush grace period of {:?} expired, aborting in-flight deliveries",
                self.grace
            );
            self.abort.cancel();
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!("IO | batcher failed: {}", e);
                }
            }
        }
        info!("IO | pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ELECTION_NAMESPACE_TAG;
    use crate::point::PointError;
    use std::collections::HashMap;

    fn metrics(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| {
                Point::builder("cpu")
                    .field("n", i64::try_from(i).expect("small"))
                    .build()
                    .expect("valid point")
            })
            .collect()
    }

    fn service(config: Config) -> (IoService, Io, CancellationToken) {
        let cancel = CancellationToken::new();
        let outputs = Outputs::new(Arc::new(Stats::default()));
        let (service, io) = IoService::new(
            Arc::new(config),
            outputs,
            ElectionState::new(),
            cancel.clone(),
        )
        .expect("service");
        (service, io, cancel)
    }

    #[tokio::test]
    async fn test_empty_feed_is_rejected() {
        let (_service, io, _) = service(Config::default());
        assert_eq!(
            io.feed("cpu", Category::Metric, Vec::new(), FeedOptions::default())
                .await,
            Err(FeedError::NoPoints)
        );
    }

    #[tokio::test]
    async fn test_full_static_lane_drops_overflow() {
        let mut config = Config::default();
        config.io.max_cache_count = 500;
        let (_service, io, _) = service(config);

        let err = io
            .feed("cpu", Category::Metric, metrics(1000), FeedOptions::default())
            .await
            .expect_err("overflow");
        assert_eq!(
            err,
            FeedError::QueueFull {
                category: Category::Metric,
                dropped: 500
            }
        );

        let stats = io.stats();
        let metric = &stats.categories[&Category::Metric];
        assert_eq!(metric.fed, 1000);
        assert_eq!(metric.queued, 500);
        assert_eq!(metric.dropped, 500);
        assert_eq!(stats.feed_chan.len, 1);
        assert_eq!(stats.inputs["cpu"].points, 1000);
    }

    #[tokio::test]
    async fn test_full_category_does_not_affect_others() {
        let mut config = Config::default();
        config.io.max_cache_count = 10;
        let (_service, io, _) = service(config);

        assert!(io
            .feed("cpu", Category::Metric, metrics(20), FeedOptions::default())
            .await
            .is_err());
        io.feed("host", Category::Object, metrics(10), FeedOptions::default())
            .await
            .expect("object queue has room");
        assert_eq!(io.stats().categories[&Category::Object].queued, 10);
    }

    #[tokio::test]
    async fn test_filter_and_host_tag() {
        let mut config = Config::default();
        config.hostname = "node-1".to_string();
        config.io.filters = HashMap::from([(
            Category::Metric,
            vec!["{ disk = 'tmpfs' }".to_string()],
        )]);
        let (mut service, io, _) = service(config);

        let points = vec![
            Point::builder("disk")
                .tag("disk", "tmpfs")
                .field("used", 1)
                .build()
                .expect("valid point"),
            Point::builder("disk")
                .tag("disk", "sda")
                .tag("host", "spoofed")
                .field("used", 2)
                .build()
                .expect("valid point"),
        ];
        io.feed("disk", Category::Metric, points, FeedOptions::default())
            .await
            .expect("feed");

        let item = service.rx.try_recv().expect("queued item");
        assert_eq!(item.points.len(), 1);
        assert_eq!(item.points[0].tag("disk"), Some("sda"));
        assert_eq!(item.points[0].tag("host"), Some("node-1"));
        assert_eq!(io.stats().categories[&Category::Metric].filtered, 1);
    }

    #[tokio::test]
    async fn test_feed_revalidates_for_category_and_injected_tags() {
        let mut config = Config::default();
        config.hostname = "node-1".to_string();
        let (mut service, io, _) = service(config);

        let points = vec![
            Point::builder("nginx")
                .tag("http.method", "GET")
                .field("message", "dotted tag")
                .build()
                .expect("built as a metric"),
            Point::builder("nginx")
                .field("host", "web-1")
                .field("message", "host clashes with the injected tag")
                .build()
                .expect("valid point"),
            Point::builder("nginx")
                .field("message", "fine")
                .build()
                .expect("valid point"),
        ];
        io.feed("tail", Category::Logging, points, FeedOptions::default())
            .await
            .expect("feed");

        let item = service.rx.try_recv().expect("queued item");
        assert_eq!(item.points.len(), 1);
        assert_eq!(
            item.points[0].field("message"),
            Some(&crate::point::FieldValue::Str("fine".to_string()))
        );
        let stats = io.stats();
        assert_eq!(stats.categories[&Category::Logging].invalid, 2);
        assert_eq!(stats.categories[&Category::Logging].queued, 1);
        assert!(stats.inputs["tail"].last_error.is_some());
    }

    #[tokio::test]
    async fn test_election_suppression() {
        let mut config = Config::default();
        config.election.enable = true;
        config.election.enable_namespace_tag = true;
        config.election.namespace = "prod".to_string();
        let state = ElectionState::new();
        let (mut service, io) = IoService::new(
            Arc::new(config),
            Outputs::new(Arc::new(Stats::default())),
            state.clone(),
            CancellationToken::new(),
        )
        .expect("service");

        io.feed("k8s", Category::Object, metrics(3), FeedOptions::default())
            .await
            .expect("suppressed feeds are not errors");
        assert!(service.rx.try_recv().is_err());
        assert_eq!(io.stats().categories[&Category::Object].election_suppressed, 3);

        state.set_leader(true);
        io.feed("k8s", Category::Object, metrics(3), FeedOptions::default())
            .await
            .expect("feed");
        let item = service.rx.try_recv().expect("queued item");
        assert!(item
            .points
            .iter()
            .all(|p| p.tag(ELECTION_NAMESPACE_TAG) == Some("prod")));
    }

    #[tokio::test]
    async fn test_high_freq_uses_dynamic_lane() {
        let mut config = Config::default();
        config.io.max_cache_count = 1;
        config.io.max_dynamic_cache_count = 5;
        let (mut service, io, _) = service(config);
        io.feed(
            "burst",
            Category::Metric,
            metrics(5),
            FeedOptions {
                high_freq: true,
                ..FeedOptions::default()
            },
        )
        .await
        .expect("dynamic lane has room");
        let item = service.rx.try_recv().expect("queued item");
        assert_eq!(item.lane, Lane::Dynamic);
    }

    #[tokio::test]
    async fn test_blocking_mode_waits_for_space() {
        let mut config = Config::default();
        config.io.max_cache_count = 2;
        config.io.blocking_mode = true;
        let (mut service, io, cancel) = service(config);
        io.feed("cpu", Category::Metric, metrics(2), FeedOptions::default())
            .await
            .expect("feed");

        let blocked = {
            let io = io.clone();
            tokio::spawn(async move {
                io.feed("cpu", Category::Metric, metrics(1), FeedOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let item = service.rx.try_recv().expect("queued item");
        service.push(item);
        assert_eq!(io.queued(Category::Metric), 2);
        service.queues[Category::Metric.index()].drain();

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("feed unblocks")
            .expect("join");
        assert_eq!(result, Ok(()));

        let again = {
            let io = io.clone();
            tokio::spawn(async move {
                io.feed("cpu", Category::Metric, metrics(5), FeedOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), again)
            .await
            .expect("shutdown unblocks")
            .expect("join");
        assert_eq!(result, Err(FeedError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_overflow_spills_to_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stats = Arc::new(Stats::default());
        let (cache, _) =
            DiskCache::open(dir.path(), 1024 * 1024, Arc::clone(&stats)).expect("cache");
        let cache = Arc::new(cache);
        let mut config = Config::default();
        config.io.max_cache_count = 2;
        let (_service, io) = IoService::new(
            Arc::new(config),
            Outputs::new(stats).with_cache(Arc::clone(&cache)),
            ElectionState::new(),
            CancellationToken::new(),
        )
        .expect("service");

        io.feed("cpu", Category::Metric, metrics(5), FeedOptions::default())
            .await
            .expect("overflow is cached");
        assert_eq!(cache.pending_points(Category::Metric), 3);
        let metric = &io.stats().categories[&Category::Metric];
        assert_eq!(metric.queued, 2);
        assert_eq!(metric.cached, 3);
        assert_eq!(metric.dropped, 0);
    }

    struct Reading(Option<f64>);

    impl Measurement for Reading {
        fn to_point(&self) -> Result<Point, PointError> {
            let mut builder = Point::builder("sensor");
            if let Some(v) = self.0 {
                builder = builder.field("value", v);
            }
            builder.build()
        }
    }

    #[tokio::test]
    async fn test_feed_measurement_records_conversion_errors() {
        let (mut service, io, _) = service(Config::default());
        io.feed_measurement(
            "sensors",
            Category::Metric,
            &[Reading(Some(1.0)), Reading(None), Reading(Some(2.0))],
            FeedOptions::default(),
        )
        .await
        .expect("feed");
        assert_eq!(service.rx.try_recv().expect("item").points.len(), 2);
        let stats = io.stats();
        assert_eq!(stats.inputs["sensors"].errors, 1);
        assert!(stats.inputs["sensors"].last_error.is_some());
    }

    #[tokio::test]
    async fn test_feed_last_error_and_shutdown() {
        let (_service, io, cancel) = service(Config::default());
        io.feed_last_error("mysql", "connection refused");
        let last = io.stats().inputs["mysql"]
            .last_error
            .clone()
            .expect("last error");
        assert_eq!(last.message, "connection refused");

        cancel.cancel();
        assert_eq!(
            io.feed("cpu", Category::Metric, metrics(1), FeedOptions::default())
                .await,
            Err(FeedError::ShuttingDown)
        );
        assert_eq!(io.stats().categories[&Category::Metric].fed, 0);
    }

    #[tokio::test]
    async fn test_run_drains_channel_on_shutdown() {
        let (service, io, cancel) = service(Config::default());
        let handle = tokio::spawn(service.run());
        io.feed("cpu", Category::Metric, metrics(3), FeedOptions::default())
            .await
            .expect("feed");
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("service stops")
            .expect("join");
        // No dataway and no sinks: the final flush counts the points as delivered.
        assert_eq!(io.stats().categories[&Category::Metric].delivered, 3);
    }
}
