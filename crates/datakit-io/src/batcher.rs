// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-category drain loop.
//!
//! A [`Batcher`] wakes on its flush interval or when its queue asks for an early flush.
//! Every cycle first waits for the previous cycle's delivery task, replays the
//! category's disk cache oldest segment first, then drains the in-memory queue into
//! batches and hands them to a new delivery task that sends them one after another.
//!
//! A batch that no Dataway target accepted goes back to the disk cache when one is
//! configured, and the rest of its cycle follows it there without touching the network.
//! When the cache replay itself fails, or every target is past the failure threshold,
//! freshly drained batches skip the network from the start. Either way the cache holds
//! points in the order they were drained.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, DiskCache};
use crate::config::Config;
use crate::dataway::{Dataway, DeliveryReport};
use crate::point::{Batch, Category, Point};
use crate::queue::{CategoryQueue, Queued};
use crate::sink::SinkRouter;
use crate::stats::Stats;

/// Everything a drained batch can be handed to.
#[derive(Clone, Debug)]
pub struct Outputs {
    pub dataway: Option<Dataway>,
    pub sinks: SinkRouter,
    pub cache: Option<Arc<DiskCache>>,
    pub stats: Arc<Stats>,
}

impl Outputs {
    #[must_use]
    pub fn new(stats: Arc<Stats>) -> Self {
        Outputs {
            dataway: None,
            sinks: SinkRouter::new(Vec::new(), Arc::clone(&stats)),
            cache: None,
            stats,
        }
    }

    #[must_use]
    pub fn with_dataway(mut self, dataway: Dataway) -> Self {
        self.dataway = Some(dataway);
        self
    }

    #[must_use]
    pub fn with_sinks(mut self, sinks: SinkRouter) -> Self {
        self.sinks = sinks;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<DiskCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn send(&self, batch: &Batch, abort: &CancellationToken) -> DeliveryReport {
        match &self.dataway {
            Some(dataway) => dataway.send(batch, abort).await,
            None => DeliveryReport::default(),
        }
    }

    /// Delivers one freshly drained batch: sinks and Dataway concurrently, then the
    /// cache if no target accepted it. Returns `true` when the batch went to the cache.
    pub async fn deliver(&self, batch: Batch, abort: &CancellationToken) -> bool {
        let (report, _) = tokio::join!(self.send(&batch, abort), self.sinks.route(&batch));
        self.settle(batch, &report, abort).await
    }

    /// Delivers `batches` in order. Once one of them is cached, the rest are deferred
    /// behind it.
    pub async fn deliver_in_order(
        &self,
        batches: Vec<Batch>,
        mut defer: bool,
        abort: &CancellationToken,
    ) {
        for batch in batches {
            if defer {
                self.defer(batch).await;
            } else {
                defer = self.deliver(batch, abort).await;
            }
        }
    }

    /// Sinks get the batch now; Dataway gets it on a later cache replay.
    pub async fn defer(&self, batch: Batch) {
        self.sinks.route(&batch).await;
        let Some(cache) = &self.cache else {
            Stats::add(&self.stats.category(batch.category).failed, batch.len());
            return;
        };
        self.spill(cache, batch).await;
    }

    async fn settle(
        &self,
        batch: Batch,
        report: &DeliveryReport,
        abort: &CancellationToken,
    ) -> bool {
        let counters = self.stats.category(batch.category);
        if !report.all_failed() {
            Stats::add(&counters.delivered, batch.len());
            return false;
        }

        warn!(
            "IO | no dataway target accepted {} points of {} from {}",
            batch.len(),
            batch.category,
            batch.origin
        );

        match &self.cache {
            Some(cache) => {
                self.spill(cache, batch).await;
                return true;
            }
            None if abort.is_cancelled() => {
                warn!(
                    "IO | shutdown grace period expired, {} points of {} lost",
                    batch.len(),
                    batch.category
                );
                Stats::add(&counters.shutdown_lost, batch.len());
            }
            None => Stats::add(&counters.failed, batch.len()),
        }
        false
    }

    /// Sinks have already seen `batch` on every path that reaches here.
    async fn spill(&self, cache: &Arc<DiskCache>, batch: Batch) {
        let category = batch.category;
        let len = batch.len();
        let entry = CacheEntry::from_batch(&batch).with_sinks_done();
        if let Err(e) = cache.put_async(entry).await {
            error!("CACHE | failed to store {} points of {}: {}", len, category, e);
            Stats::add(&self.stats.category(category).failed, len);
        }
    }
}

/// Splits drained points into batches. A batch never mixes origins, never exceeds
/// `max_points`, and stays under `max_bytes` unless a single point is larger.
#[must_use]
pub fn split_batches(
    category: Category,
    drained: Vec<Queued>,
    max_points: usize,
    max_bytes: usize,
) -> Vec<Batch> {
    let max_points = max_points.max(1);
    let mut batches = Vec::new();
    let mut origin: Option<Arc<str>> = None;
    let mut points: Vec<Point> = Vec::new();
    let mut bytes = 0;

    for queued in drained {
        let size = queued.point.size_hint();
        let same_origin = origin.as_ref().is_some_and(|o| *o == queued.origin);
        let full = points.len() >= max_points || (bytes + size > max_bytes && !points.is_empty());
        if !points.is_empty() && (!same_origin || full) {
            let done = std::mem::take(&mut points);
            batches.push(Batch::new(
                category,
                origin.as_deref().unwrap_or_default(),
                done,
            ));
            bytes = 0;
        }
        if !same_origin {
            origin = Some(Arc::clone(&queued.origin));
        }
        bytes += size;
        points.push(queued.point);
    }
    if !points.is_empty() {
        batches.push(Batch::new(
            category,
            origin.as_deref().unwrap_or_default(),
            points,
        ));
    }
    batches
}

pub struct Batcher {
    queue: Arc<CategoryQueue>,
    outputs: Outputs,
    flush_interval: Duration,
    max_batch_points: usize,
    max_batch_bytes: usize,
    max_send_fail_count: u32,
    abort: CancellationToken,
    in_flight: JoinSet<()>,
}

impl Batcher {
    /// `abort` interrupts in-flight deliveries; it is meant to fire when the shutdown
    /// grace period runs out.
    #[must_use]
    pub fn new(
        queue: Arc<CategoryQueue>,
        outputs: Outputs,
        config: &Config,
        abort: CancellationToken,
    ) -> Self {
        Batcher {
            queue,
            outputs,
            flush_interval: config.io.flush_interval,
            max_batch_points: config.io.max_batch_points,
            max_batch_bytes: config.io.max_batch_bytes,
            max_send_fail_count: config.dataway.max_send_fail_count,
            abort,
            in_flight: JoinSet::new(),
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.queue.category()
    }

    /// Runs until `stop` fires, then performs one final flush.
    pub async fn run(mut self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        debug!("IO | {} batcher started", self.category());

        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = ticker.tick() => {},
                () = self.queue.flush_requested() => {},
            }
            self.flush().await;
        }

        self.shutdown().await;
    }

    fn throttled(&self) -> bool {
        self.outputs.cache.is_some()
            && self
                .outputs
                .dataway
                .as_ref()
                .is_some_and(|d| d.should_throttle(self.max_send_fail_count))
    }

    /// Waits for the previous cycle's delivery task, so everything it spilled is in the
    /// cache before the next replay.
    async fn settle_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            if let Err(e) = joined {
                error!("IO | {} delivery task failed: {}", self.category(), e);
            }
        }
    }

    fn hand_off(&mut self, batches: Vec<Batch>, defer: bool) {
        let outputs = self.outputs.clone();
        let abort = self.abort.clone();
        self.in_flight
            .spawn(async move { outputs.deliver_in_order(batches, defer, &abort).await });
    }

    /// One drain cycle. Returns the number of batches handed off.
    pub async fn flush(&mut self) -> usize {
        self.settle_in_flight().await;

        let upstream_down = !self.replay().await || self.throttled();

        let drained = self.queue.drain();
        if drained.is_empty() {
            return 0;
        }
        let batches = split_batches(
            self.category(),
            drained,
            self.max_batch_points,
            self.max_batch_bytes,
        );
        let count = batches.len();
        if upstream_down {
            debug!(
                "IO | dataway unavailable, deferring {} {} batches to the cache",
                count,
                self.category()
            );
        }
        self.hand_off(batches, upstream_down);
        count
    }

    /// Delivers cached segments of this category, oldest first, until the cache is empty
    /// or a delivery fails. Returns `false` on failure; entries delivered before the
    /// failure are removed from the cache.
    async fn replay(&self) -> bool {
        let Some(cache) = &self.outputs.cache else {
            return true;
        };
        let category = self.category();
        let counters = self.outputs.stats.category(category);
        loop {
            if self.abort.is_cancelled() {
                return false;
            }
            let lease = match cache.lease_async(category).await {
                Ok(Some(lease)) => lease,
                Ok(None) => return true,
                Err(e) => {
                    error!("CACHE | failed to read {} segment: {}", category, e);
                    return false;
                }
            };

            let mut delivered = 0;
            let mut points = 0;
            for entry in &lease.entries {
                let batch =
                    Batch::new(entry.category, entry.origin.clone(), entry.points.clone());
                if self.outputs.send(&batch, &self.abort).await.all_failed() {
                    break;
                }
                if !entry.sinks_done {
                    self.outputs.sinks.route(&batch).await;
                }
                delivered += 1;
                points += batch.len();
            }
            Stats::add(&counters.delivered, points);

            if delivered < lease.entries.len() {
                debug!(
                    "CACHE | replay of {} paused after {} of {} entries, dataway unavailable",
                    category,
                    delivered,
                    lease.entries.len()
                );
                if let Err(e) = cache.commit_partial(&lease, delivered) {
                    error!("CACHE | failed to trim replayed {} segment: {}", category, e);
                }
                return false;
            }
            if let Err(e) = cache.commit(&lease) {
                error!("CACHE | failed to remove delivered {} segment: {}", category, e);
            }
            info!("CACHE | replayed {} points of {}", points, category);
        }
    }

    /// Drains what is left and waits for every delivery task. Deliveries still running
    /// when `abort` fires end up in the cache or are counted as lost.
    async fn shutdown(mut self) {
        self.settle_in_flight().await;
        let category = self.category();
        let drained = self.queue.drain();
        let batches = split_batches(
            category,
            drained,
            self.max_batch_points,
            self.max_batch_bytes,
        );
        if !batches.is_empty() {
            debug!("IO | final flush of {} {} batches", batches.len(), category);
            let throttled = self.throttled();
            self.hand_off(batches, throttled);
        }
        self.settle_in_flight().await;
        debug!("IO | {} batcher stopped", category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatawayConfig;
    use crate::point::FieldValue;
    use crate::queue::Lane;
    use mockito::Matcher;
    use std::sync::atomic::Ordering;

    fn point(n: i64) -> Point {
        Point::builder("log")
            .category(Category::Logging)
            .field("n", n)
            .time_nanos(n)
            .build()
            .expect("valid point")
    }

    fn queued(queue: &CategoryQueue, origin: &str, range: std::ops::Range<i64>) {
        let origin: Arc<str> = Arc::from(origin);
        let points: Vec<Point> = range.map(point).collect();
        let reserved = queue.try_reserve(Lane::Dynamic, points.len());
        assert_eq!(reserved, points.len());
        queue.push(Lane::Dynamic, &origin, points);
    }

    fn numbers(points: &[Point]) -> Vec<i64> {
        points
            .iter()
            .filter_map(|p| match p.field("n") {
                Some(FieldValue::Int(n)) => Some(*n),
                _ => None,
            })
            .collect()
    }

    fn config(urls: Vec<String>) -> Config {
        let mut config = Config::default();
        config.io.max_batch_points = 4;
        config.dataway = DatawayConfig {
            urls,
            retry_count: 2,
            retry_backoff: Duration::ZERO,
            timeout: Duration::from_secs(2),
            gzip: false,
            ..DatawayConfig::default()
        };
        config
    }

    #[test]
    fn test_split_respects_origin_and_size() {
        let queue = CategoryQueue::new(Category::Logging, 100, 100, 1000);
        queued(&queue, "nginx", 0..6);
        queued(&queue, "redis", 6..7);
        queued(&queue, "nginx", 7..8);

        let batches = split_batches(Category::Logging, queue.drain(), 4, usize::MAX);
        let shape: Vec<(&str, Vec<i64>)> = batches
            .iter()
            .map(|b| (b.origin.as_str(), numbers(&b.points)))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("nginx", vec![0, 1, 2, 3]),
                ("nginx", vec![4, 5]),
                ("redis", vec![6]),
                ("nginx", vec![7]),
            ]
        );
    }

    #[test]
    fn test_split_by_bytes_keeps_oversized_point() {
        let queue = CategoryQueue::new(Category::Logging, 100, 100, 1000);
        queued(&queue, "tail", 0..3);
        let one = point(0).size_hint();
        let batches = split_batches(Category::Logging, queue.drain(), 100, one);
        assert_eq!(batches.len(), 3);

        let queue = CategoryQueue::new(Category::Logging, 100, 100, 1000);
        queued(&queue, "tail", 0..1);
        let batches = split_batches(Category::Logging, queue.drain(), 100, 1);
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::UrlEncoded("input".into(), "tail".into()))
            .match_body(Matcher::Regex("^log n=0i 0\nlog n=1i 1\nlog n=2i 2\n$".into()))
            .with_status(200)
            .create_async()
            .await;

        let cfg = config(vec![server.url()]);
        let stats = Arc::new(Stats::default());
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"));
        let queue = Arc::new(CategoryQueue::new(Category::Logging, 10, 10, 100));
        queued(&queue, "tail", 0..3);

        let mut batcher = Batcher::new(queue, outputs, &cfg, CancellationToken::new());
        assert_eq!(batcher.flush().await, 1);
        batcher.shutdown().await;

        mock.assert_async().await;
        assert_eq!(
            stats.category(Category::Logging).delivered.load(Ordering::Relaxed),
            3
        );
    }

    #[tokio::test]
    async fn test_failed_batch_is_cached_then_replayed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = mockito::Server::new_async().await;
        let down = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let cfg = config(vec![server.url()]);
        let stats = Arc::new(Stats::default());
        let (cache, _) =
            DiskCache::open(dir.path(), 1024 * 1024, Arc::clone(&stats)).expect("cache");
        let cache = Arc::new(cache);
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"))
            .with_cache(Arc::clone(&cache));
        let queue = Arc::new(CategoryQueue::new(Category::Logging, 10, 10, 100));
        queued(&queue, "tail", 0..3);

        let mut batcher =
            Batcher::new(Arc::clone(&queue), outputs, &cfg, CancellationToken::new());
        batcher.flush().await;
        batcher.settle_in_flight().await;
        down.assert_async().await;
        assert_eq!(cache.pending_points(Category::Logging), 3);
        let counters = stats.category(Category::Logging);
        assert_eq!(counters.cached.load(Ordering::Relaxed), 3);
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 0);

        down.remove_async().await;
        let up = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex("^log n=0i 0\nlog n=1i 1\nlog n=2i 2\n$".into()))
            .with_status(200)
            .create_async()
            .await;
        batcher.flush().await;
        up.assert_async().await;
        assert!(cache.is_empty(Category::Logging));
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 3);
    }

    fn open_cache(dir: &std::path::Path, stats: &Arc<Stats>) -> Arc<DiskCache> {
        let (cache, _) =
            DiskCache::open(dir, 1024 * 1024, Arc::clone(stats)).expect("cache");
        Arc::new(cache)
    }

    fn cached_numbers(cache: &DiskCache) -> Vec<i64> {
        let mut seen = Vec::new();
        while let Some(lease) = cache.lease(Category::Logging).expect("lease") {
            for entry in &lease.entries {
                seen.extend(numbers(&entry.points));
            }
            cache.commit(&lease).expect("commit");
        }
        seen
    }

    #[tokio::test]
    async fn test_failed_cycle_is_cached_in_drain_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = mockito::Server::new_async().await;
        // Only the first batch reaches the network; the other two follow it to the cache.
        let down = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let cfg = config(vec![server.url()]);
        let stats = Arc::new(Stats::default());
        let cache = open_cache(dir.path(), &stats);
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"))
            .with_cache(Arc::clone(&cache));
        let queue = Arc::new(CategoryQueue::new(Category::Logging, 100, 100, 1000));
        queued(&queue, "tail", 0..12);

        let mut batcher = Batcher::new(queue, outputs, &cfg, CancellationToken::new());
        assert_eq!(batcher.flush().await, 3);
        batcher.settle_in_flight().await;
        down.assert_async().await;

        assert_eq!(cached_numbers(&cache), (0..12).collect::<Vec<_>>());
        assert_eq!(
            stats.category(Category::Logging).cached.load(Ordering::Relaxed),
            12
        );
    }

    #[tokio::test]
    async fn test_partial_replay_keeps_only_undelivered_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink_path = dir.path().join("logging.json");
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex("n=0i".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let second_down = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex("n=1i".into()))
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let cfg = config(vec![server.url()]);
        let stats = Arc::new(Stats::default());
        let cache = open_cache(&dir.path().join("cache"), &stats);
        for n in 0..2 {
            cache
                .put(&CacheEntry::new(Category::Logging, "tail", vec![point(n)]))
                .expect("put");
        }
        let sink: Arc<dyn crate::sink::Sink> =
            Arc::new(crate::sink::file::FileSink::new(&sink_path, Vec::new()));
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"))
            .with_sinks(SinkRouter::new(vec![sink], Arc::clone(&stats)))
            .with_cache(Arc::clone(&cache));
        let queue = Arc::new(CategoryQueue::new(Category::Logging, 10, 10, 100));
        let mut batcher = Batcher::new(queue, outputs, &cfg, CancellationToken::new());

        batcher.flush().await;
        second_down.assert_async().await;
        assert_eq!(cache.pending_points(Category::Logging), 1);
        let sunk = std::fs::read_to_string(&sink_path).expect("sink file");
        assert_eq!(sunk.lines().count(), 1);

        second_down.remove_async().await;
        let second_up = server
            .mock("POST", "/v1/write/logging")
            .match_query(Matcher::Any)
            .match_body(Matcher::Regex("n=1i".into()))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        batcher.flush().await;

        first.assert_async().await;
        second_up.assert_async().await;
        assert!(cache.is_empty(Category::Logging));
        let sunk = std::fs::read_to_string(&sink_path).expect("sink file");
        assert_eq!(sunk.lines().count(), 2);
        assert_eq!(
            stats.category(Category::Logging).delivered.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_no_cache_counts_failures() {
        let cfg = config(vec!["http://127.0.0.1:1".to_string()]);
        let stats = Arc::new(Stats::default());
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"));
        let batch = Batch::new(Category::Logging, "tail", (0..2).map(point).collect());
        outputs.deliver(batch, &CancellationToken::new()).await;
        let counters = stats.category(Category::Logging);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 2);
        assert_eq!(counters.shutdown_lost.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_aborted_delivery_is_counted_as_shutdown_loss() {
        let cfg = config(vec!["http://127.0.0.1:1".to_string()]);
        let stats = Arc::new(Stats::default());
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_dataway(Dataway::new(&cfg.dataway).expect("dataway"));
        let abort = CancellationToken::new();
        abort.cancel();
        let batch = Batch::new(Category::Logging, "tail", (0..2).map(point).collect());
        outputs.deliver(batch, &abort).await;
        let counters = stats.category(Category::Logging);
        assert_eq!(counters.shutdown_lost.load(Ordering::Relaxed), 2);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_without_dataway_batches_only_reach_sinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logging.json");
        let stats = Arc::new(Stats::default());
        let sink: Arc<dyn crate::sink::Sink> =
            Arc::new(crate::sink::file::FileSink::new(&path, Vec::new()));
        let outputs = Outputs::new(Arc::clone(&stats))
            .with_sinks(SinkRouter::new(vec![sink], Arc::clone(&stats)));
        let batch = Batch::new(Category::Logging, "tail", (0..2).map(point).collect());
        outputs.deliver(batch, &CancellationToken::new()).await;

        let content = std::fs::read_to_string(&path).expect("sink file");
        assert_eq!(content.lines().count(), 2);
        assert_eq!(
            stats.category(Category::Logging).delivered.load(Ordering::Relaxed),
            2
        );
    }
}
