// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk overflow cache.
//!
//! Points that cannot be held in memory (full lane) or delivered (every Dataway target
//! failed) are persisted here and delivered later, oldest first.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   metric/
//!     00000000000000000003.seg
//!   logging/
//!     00000000000000000001.seg
//!     00000000000000000004.seg
//! ```
//!
//! One directory per category, each a FIFO of append-only segment files named by a
//! sequence number shared across categories. Segments are sealed once they reach the
//! segment size or are handed to the Batcher; new entries then start a fresh segment.
//!
//! # Lifecycle
//!
//! - [`DiskCache::put`] appends an entry, evicting whole segments from the global head
//!   while the byte budget would be exceeded. Evictions are counted per category.
//! - [`DiskCache::lease`] hands the oldest segment of a category to the Batcher.
//! - [`DiskCache::commit`] deletes it after a confirmed delivery; [`DiskCache::release`]
//!   puts it back at the head after a failure.
//! - [`DiskCache::open`] rebuilds the index from disk so a restarted process replays
//!   whatever the previous one left behind. A torn final frame is truncated away; a
//!   segment with an undecodable frame is dropped and counted.

mod segment;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::point::{now_nanos, Batch, Category, Point};
use crate::stats::Stats;

const MAX_SEGMENT_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("entry of {0} bytes does not fit in the cache budget")]
    EntryTooLarge(usize),
    #[error("cache budget exhausted by segments currently being delivered")]
    BudgetExhausted,
    #[error("cache lock poisoned")]
    Poisoned,
}

/// A persisted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub category: Category,
    pub origin: String,
    /// Nanoseconds since the Unix epoch.
    pub enqueued_at: i64,
    pub points: Vec<Point>,
    /// Sinks already received these points; replay only goes to Dataway.
    #[serde(default)]
    pub sinks_done: bool,
}

impl CacheEntry {
    #[must_use]
    pub fn new(category: Category, origin: impl Into<String>, points: Vec<Point>) -> Self {
        CacheEntry {
            category,
            origin: origin.into(),
            enqueued_at: now_nanos(),
            points,
            sinks_done: false,
        }
    }

    #[must_use]
    pub fn with_sinks_done(mut self) -> Self {
        self.sinks_done = true;
        self
    }

    #[must_use]
    pub fn from_batch(batch: &Batch) -> Self {
        Self::new(batch.category, batch.origin.clone(), batch.points.clone())
    }
}

#[derive(Debug)]
struct Segment {
    seq: u64,
    path: PathBuf,
    bytes: u64,
    entries: usize,
    points: usize,
    sealed: bool,
    leased: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    categories: [VecDeque<Segment>; Category::ALL.len()],
    total_bytes: u64,
    next_seq: u64,
}

/// The oldest segment of a category, checked out for delivery.
#[derive(Debug)]
pub struct Lease {
    pub category: Category,
    seq: u64,
    pub entries: Vec<CacheEntry>,
}

impl Lease {
    #[must_use]
    pub fn points(&self) -> usize {
        self.entries.iter().map(|e| e.points.len()).sum()
    }
}

/// What [`DiskCache::open`] found on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub segments: usize,
    pub entries: usize,
    pub points: usize,
    pub corrupt_segments: usize,
    pub by_category: BTreeMap<Category, usize>,
}

#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    max_bytes: u64,
    segment_max_bytes: u64,
    state: Mutex<CacheState>,
    stats: Arc<Stats>,
}

impl DiskCache {
    /// Opens (or creates) the cache rooted at `root` and indexes every segment left by a
    /// previous run.
    pub fn open(
        root: impl Into<PathBuf>,
        max_bytes: u64,
        stats: Arc<Stats>,
    ) -> Result<(Self, ReplaySummary), CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let cache = DiskCache {
            segment_max_bytes: (max_bytes / 4).clamp(1, MAX_SEGMENT_BYTES),
            root,
            max_bytes,
            state: Mutex::new(CacheState::default()),
            stats,
        };
        let summary = cache.replay()?;
        if summary.segments > 0 {
            info!(
                "CACHE | replaying {} entries ({} points) from {} segments",
                summary.entries, summary.points, summary.segments
            );
        }
        Ok((cache, summary))
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state.lock().map_err(|_| CacheError::Poisoned)
    }

    fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.name())
    }

    fn replay(&self) -> Result<ReplaySummary, CacheError> {
        let mut state = self.lock()?;
        let mut summary = ReplaySummary::default();
        let mut max_seq = None;

        for category in Category::ALL {
            let dir = self.category_dir(category);
            if !dir.is_dir() {
                continue;
            }
            let mut found: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter_map(|p| segment::parse_seq(&p).map(|seq| (seq, p)))
                .collect();
            found.sort_by_key(|(seq, _)| *seq);

            for (seq, path) in found {
                max_seq = max_seq.max(Some(seq));
                let outcome = match segment::read(&path) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("CACHE | unreadable segment {}: {}", path.display(), e);
                        self.discard_corrupt(&path, &mut summary);
                        continue;
                    }
                };
                if outcome.corrupt {
                    warn!("CACHE | corrupt segment {}, skipping", path.display());
                    self.discard_corrupt(&path, &mut summary);
                    continue;
                }
                if outcome.torn_tail {
                    warn!(
                        "CACHE | truncating torn frame at the end of {}",
                        path.display()
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(&path)?
                        .set_len(outcome.valid_len)?;
                }
                if outcome.entries.is_empty() {
                    let _ = fs::remove_file(&path);
                    continue;
                }

                let points = outcome.entries.iter().map(|e| e.points.len()).sum();
                summary.segments += 1;
                summary.entries += outcome.entries.len();
                summary.points += points;
                *summary.by_category.entry(category).or_default() += points;
                state.total_bytes += outcome.valid_len;
                state.categories[category.index()].push_back(Segment {
                    seq,
                    path,
                    bytes: outcome.valid_len,
                    entries: outcome.entries.len(),
                    points,
                    sealed: true,
                    leased: false,
                });
            }
        }

        state.next_seq = max_seq.map_or(0, |s| s + 1);
        while state.total_bytes > self.max_bytes {
            if !self.evict_oldest(&mut state) {
                break;
            }
        }
        Ok(summary)
    }

    fn discard_corrupt(&self, path: &Path, summary: &mut ReplaySummary) {
        summary.corrupt_segments += 1;
        self.stats
            .cache_corrupt_segments
            .fetch_add(1, Ordering::Relaxed);
        if let Err(e) = fs::remove_file(path) {
            error!("CACHE | failed to remove {}: {}", path.display(), e);
        }
    }

    /// Drops the globally oldest segment that is not out for delivery. A leased head
    /// does not shield the segments queued behind it.
    fn evict_oldest(&self, state: &mut CacheState) -> bool {
        let victim = state
            .categories
            .iter()
            .enumerate()
            .filter_map(|(i, q)| {
                q.iter()
                    .position(|s| !s.leased)
                    .map(|pos| (q[pos].seq, i, pos))
            })
            .min();
        let Some((_, index, pos)) = victim else {
            return false;
        };
        let Some(segment) = state.categories[index].remove(pos) else {
            return false;
        };
        let category = Category::ALL[index];
        state.total_bytes = state.total_bytes.saturating_sub(segment.bytes);
        Stats::add(
            &self.stats.category(category).cache_evicted,
            segment.points,
        );
        warn!(
            "CACHE | budget exceeded, evicted {} entries ({} points) of {}",
            segment.entries, segment.points, category
        );
        if let Err(e) = fs::remove_file(&segment.path) {
            error!("CACHE | failed to remove {}: {}", segment.path.display(), e);
        }
        true
    }

    /// Appends one entry to the tail of its category.
    pub fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let frame = segment::encode_frame(entry)?;
        let len = frame.len() as u64;
        if len > self.max_bytes {
            return Err(CacheError::EntryTooLarge(frame.len()));
        }

        let mut state = self.lock()?;
        while state.total_bytes + len > self.max_bytes {
            if !self.evict_oldest(&mut state) {
                return Err(CacheError::BudgetExhausted);
            }
        }

        let index = entry.category.index();
        let reuse_tail = state.categories[index]
            .back()
            .is_some_and(|s| !s.sealed && !s.leased && s.bytes + len <= self.segment_max_bytes);
        if !reuse_tail {
            if let Some(tail) = state.categories[index].back_mut() {
                tail.sealed = true;
            }
            let dir = self.category_dir(entry.category);
            fs::create_dir_all(&dir)?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.categories[index].push_back(Segment {
                seq,
                path: dir.join(segment::file_name(seq)),
                bytes: 0,
                entries: 0,
                points: 0,
                sealed: false,
                leased: false,
            });
        }

        let Some(tail) = state.categories[index].back_mut() else {
            return Err(CacheError::Poisoned);
        };
        segment::append(&tail.path, &frame)?;
        tail.bytes += len;
        tail.entries += 1;
        tail.points += entry.points.len();
        state.total_bytes += len;
        drop(state);

        Stats::add(
            &self.stats.category(entry.category).cached,
            entry.points.len(),
        );
        debug!(
            "CACHE | stored {} points of {} from {}",
            entry.points.len(),
            entry.category,
            entry.origin
        );
        Ok(())
    }

    /// Checks out the oldest segment of `category`. Returns `None` when the category is
    /// empty or its head is already out for delivery.
    pub fn lease(&self, category: Category) -> Result<Option<Lease>, CacheError> {
        let mut state = self.lock()?;
        loop {
            let queue = &mut state.categories[category.index()];
            let Some(head) = queue.front_mut() else {
                return Ok(None);
            };
            if head.leased {
                return Ok(None);
            }
            head.leased = true;
            head.sealed = true;
            let seq = head.seq;
            let path = head.path.clone();

            match segment::read(&path) {
                Ok(outcome) if !outcome.entries.is_empty() => {
                    if outcome.corrupt || outcome.torn_tail {
                        warn!("CACHE | {} ends in a bad frame, delivering the readable prefix", path.display());
                        self.stats
                            .cache_corrupt_segments
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(Some(Lease {
                        category,
                        seq,
                        entries: outcome.entries,
                    }));
                }
                Ok(_) => warn!("CACHE | corrupt segment {}, skipping", path.display()),
                Err(e) => warn!("CACHE | unreadable segment {}: {}", path.display(), e),
            }

            // Nothing usable: drop the segment and look at the next one.
            self.stats
                .cache_corrupt_segments
                .fetch_add(1, Ordering::Relaxed);
            if let Some(segment) = state.categories[category.index()].pop_front() {
                state.total_bytes = state.total_bytes.saturating_sub(segment.bytes);
                let _ = fs::remove_file(&segment.path);
            }
        }
    }

    /// Deletes a leased segment after its entries were delivered.
    pub fn commit(&self, lease: &Lease) -> Result<(), CacheError> {
        let mut state = self.lock()?;
        let queue = &mut state.categories[lease.category.index()];
        let Some(pos) = queue.iter().position(|s| s.seq == lease.seq) else {
            // Evicted while out for delivery.
            return Ok(());
        };
        let Some(segment) = queue.remove(pos) else {
            return Ok(());
        };
        state.total_bytes = state.total_bytes.saturating_sub(segment.bytes);
        drop(state);
        fs::remove_file(&segment.path)?;
        Ok(())
    }

    /// Removes the first `delivered` entries of a leased segment and returns the rest to
    /// the head of its category. On error the whole segment is released.
    pub fn commit_partial(&self, lease: &Lease, delivered: usize) -> Result<(), CacheError> {
        if delivered >= lease.entries.len() {
            return self.commit(lease);
        }
        if delivered == 0 {
            self.release(lease);
            return Ok(());
        }
        let result = self.rewrite_remaining(lease, delivered);
        if result.is_err() {
            self.release(lease);
        }
        result
    }

    fn rewrite_remaining(&self, lease: &Lease, delivered: usize) -> Result<(), CacheError> {
        let remaining = &lease.entries[delivered..];
        let mut data = Vec::new();
        for entry in remaining {
            data.extend_from_slice(&segment::encode_frame(entry)?);
        }
        let len = data.len() as u64;

        let mut state = self.lock()?;
        let CacheState {
            categories,
            total_bytes,
            ..
        } = &mut *state;
        let Some(seg) = categories[lease.category.index()]
            .iter_mut()
            .find(|s| s.seq == lease.seq)
        else {
            // Evicted while out for delivery.
            return Ok(());
        };
        segment::rewrite(&seg.path, &data)?;
        *total_bytes = total_bytes.saturating_sub(seg.bytes) + len;
        seg.bytes = len;
        seg.entries = remaining.len();
        seg.points = remaining.iter().map(|e| e.points.len()).sum();
        seg.leased = false;
        debug!(
            "CACHE | kept {} undelivered entries of {}",
            remaining.len(),
            lease.category
        );
        Ok(())
    }

    /// Returns a leased segment to the head of its category.
    pub fn release(&self, lease: &Lease) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let Some(segment) = state.categories[lease.category.index()]
            .iter_mut()
            .find(|s| s.seq == lease.seq)
        {
            segment.leased = false;
        }
    }

    /// Points currently stored for `category`.
    #[must_use]
    pub fn pending_points(&self, category: Category) -> usize {
        self.lock().map_or(0, |s| {
            s.categories[category.index()]
                .iter()
                .map(|seg| seg.points)
                .sum()
        })
    }

    #[must_use]
    pub fn is_empty(&self, category: Category) -> bool {
        self.lock()
            .map_or(true, |s| s.categories[category.index()].is_empty())
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().map_or(0, |s| s.total_bytes)
    }

    /// [`Self::put`] on the blocking pool.
    pub async fn put_async(self: &Arc<Self>, entry: CacheEntry) -> Result<(), CacheError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.put(&entry))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))?
    }

    /// [`Self::lease`] on the blocking pool.
    pub async fn lease_async(
        self: &Arc<Self>,
        category: Category,
    ) -> Result<Option<Lease>, CacheError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.lease(category))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))?
    }
}
