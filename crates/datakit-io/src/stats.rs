// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline counters.
//!
//! Category counters are plain atomics so hot paths never take a lock; per-input
//! bookkeeping (last feed, last error) sits behind a short-lived mutex.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::error;

use crate::point::{now_nanos, Category};

#[derive(Debug, Default)]
pub struct CategoryCounters {
    pub fed: AtomicU64,
    pub queued: AtomicU64,
    pub filtered: AtomicU64,
    pub invalid: AtomicU64,
    pub election_suppressed: AtomicU64,
    pub dropped: AtomicU64,
    pub cached: AtomicU64,
    pub cache_evicted: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub sink_failures: AtomicU64,
    pub shutdown_lost: AtomicU64,
}

impl CategoryCounters {
    fn snapshot(&self) -> CategorySnapshot {
        CategorySnapshot {
            fed: self.fed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            election_suppressed: self.election_suppressed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
            cache_evicted: self.cache_evicted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            sink_failures: self.sink_failures.load(Ordering::Relaxed),
            shutdown_lost: self.shutdown_lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategorySnapshot {
    pub fed: u64,
    pub queued: u64,
    pub filtered: u64,
    pub invalid: u64,
    pub election_suppressed: u64,
    pub dropped: u64,
    pub cached: u64,
    pub cache_evicted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub sink_failures: u64,
    pub shutdown_lost: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub message: String,
    /// Nanoseconds since the Unix epoch.
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputStats {
    pub category: Option<Category>,
    pub feeds: u64,
    pub points: u64,
    pub last_feed: i64,
    pub total_cost_ms: u64,
    pub max_cost_ms: u64,
    pub last_error: Option<LastError>,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChanStat {
    pub len: usize,
    pub cap: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub categories: BTreeMap<Category, CategorySnapshot>,
    pub inputs: BTreeMap<String, InputStats>,
    pub feed_chan: ChanStat,
    pub cache_corrupt_segments: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    categories: [CategoryCounters; Category::ALL.len()],
    inputs: Mutex<BTreeMap<String, InputStats>>,
    pub cache_corrupt_segments: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn category(&self, category: Category) -> &CategoryCounters {
        &self.categories[category.index()]
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_feed(
        &self,
        origin: &str,
        category: Category,
        points: usize,
        cost: Option<Duration>,
    ) {
        let Ok(mut inputs) = self.inputs.lock() else {
            error!("IO | input stats lock poisoned");
            return;
        };
        let entry = inputs.entry(origin.to_string()).or_default();
        entry.category = Some(category);
        entry.feeds += 1;
        entry.points += points as u64;
        entry.last_feed = now_nanos();
        if let Some(cost) = cost {
            let ms = u64::try_from(cost.as_millis()).unwrap_or(u64::MAX);
            entry.total_cost_ms = entry.total_cost_ms.saturating_add(ms);
            entry.max_cost_ms = entry.max_cost_ms.max(ms);
        }
    }

    pub fn record_error(&self, origin: &str, message: &str) {
        let Ok(mut inputs) = self.inputs.lock() else {
            error!("IO | input stats lock poisoned");
            return;
        };
        let entry = inputs.entry(origin.to_string()).or_default();
        entry.errors += 1;
        entry.last_error = Some(LastError {
            message: message.to_string(),
            time: now_nanos(),
        });
    }

    #[must_use]
    pub fn last_error(&self, origin: &str) -> Option<LastError> {
        self.inputs
            .lock()
            .ok()
            .and_then(|inputs| inputs.get(origin).and_then(|s| s.last_error.clone()))
    }

    #[must_use]
    pub fn snapshot(&self, feed_chan: ChanStat) -> StatsSnapshot {
        let categories = Category::ALL
            .iter()
            .map(|c| (*c, self.category(*c).snapshot()))
            .collect();
        let inputs = self
            .inputs
            .lock()
            .map(|inputs| inputs.clone())
            .unwrap_or_default();
        StatsSnapshot {
            categories,
            inputs,
            feed_chan,
            cache_corrupt_segments: self.cache_corrupt_segments.load(Ordering::Relaxed),
        }
    }
}
