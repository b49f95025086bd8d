// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory buffer for one category.
//!
//! The queue is split into a *static* lane for steady collectors and a *dynamic* lane
//! for bursty producers, each with its own capacity. Capacity is tracked with a
//! semaphore per lane: producers reserve permits before handing points to the feed
//! channel, so occupancy (queued plus in-flight points) can never exceed the configured
//! maximum, and a producer waiting on a full lane only ever waits on its own category.
//!
//! Points carry a per-category sequence number assigned on push. Draining merges both
//! lanes by sequence, so the Batcher sees points in submission order regardless of the
//! lane they travelled through.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tracing::error;

use crate::point::{Category, Point};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    Static,
    Dynamic,
}

/// A point waiting in a lane together with the collector that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Queued {
    seq: u64,
    pub origin: Arc<str>,
    pub point: Point,
}

#[derive(Debug, Default)]
struct Lanes {
    static_lane: VecDeque<Queued>,
    dynamic_lane: VecDeque<Queued>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct CategoryQueue {
    category: Category,
    static_capacity: usize,
    dynamic_capacity: usize,
    static_permits: Semaphore,
    dynamic_permits: Semaphore,
    lanes: Mutex<Lanes>,
    flush_threshold: usize,
    flush: Notify,
}

impl CategoryQueue {
    #[must_use]
    pub fn new(
        category: Category,
        static_capacity: usize,
        dynamic_capacity: usize,
        flush_threshold: usize,
    ) -> Self {
        CategoryQueue {
            category,
            static_capacity,
            dynamic_capacity,
            static_permits: Semaphore::new(static_capacity),
            dynamic_permits: Semaphore::new(dynamic_capacity),
            lanes: Mutex::new(Lanes::default()),
            flush_threshold: flush_threshold.max(1),
            flush: Notify::new(),
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn lane_for(&self, high_freq: bool) -> Lane {
        if high_freq || self.category.is_dynamic() {
            Lane::Dynamic
        } else {
            Lane::Static
        }
    }

    #[must_use]
    pub fn capacity(&self, lane: Lane) -> usize {
        match lane {
            Lane::Static => self.static_capacity,
            Lane::Dynamic => self.dynamic_capacity,
        }
    }

    fn permits(&self, lane: Lane) -> &Semaphore {
        match lane {
            Lane::Static => &self.static_permits,
            Lane::Dynamic => &self.dynamic_permits,
        }
    }

    /// Points queued or reserved in `lane`.
    #[must_use]
    pub fn occupancy(&self, lane: Lane) -> usize {
        self.capacity(lane)
            .saturating_sub(self.permits(lane).available_permits())
    }

    #[must_use]
    pub fn is_full(&self, lane: Lane) -> bool {
        self.permits(lane).available_permits() == 0
    }

    /// Reserves up to `n` slots without waiting. Returns the number reserved.
    pub fn try_reserve(&self, lane: Lane, n: usize) -> usize {
        let permits = self.permits(lane);
        loop {
            let want = n.min(permits.available_permits()).min(u32::MAX as usize);
            if want == 0 {
                return 0;
            }
            #[allow(clippy::cast_possible_truncation)]
            match permits.try_acquire_many(want as u32) {
                Ok(permit) => {
                    permit.forget();
                    return want;
                }
                // Another producer took the permits in between; look again.
                Err(TryAcquireError::NoPermits) => continue,
                Err(TryAcquireError::Closed) => return 0,
            }
        }
    }

    /// Reserves between one and `n` slots, waiting for the Batcher to free space when the
    /// lane is full. The caller races this against its shutdown signal.
    pub async fn reserve(&self, lane: Lane, n: usize) -> usize {
        let got = self.try_reserve(lane, n);
        if got > 0 || n == 0 {
            return got;
        }

        let chunk = n.min(self.capacity(lane)).min(u32::MAX as usize);
        if chunk == 0 {
            return 0;
        }
        self.request_flush();
        #[allow(clippy::cast_possible_truncation)]
        match self.permits(lane).acquire_many(chunk as u32).await {
            Ok(permit) => {
                permit.forget();
                chunk
            }
            Err(_) => 0,
        }
    }

    /// Returns reserved slots that were never pushed.
    pub fn release(&self, lane: Lane, n: usize) {
        if n > 0 {
            self.permits(lane).add_permits(n);
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Lanes>> {
        match self.lanes.lock() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("IO | {} queue lock poisoned: {}", self.category, e);
                None
            }
        }
    }

    /// Appends points for which slots were reserved with [`Self::try_reserve`] or
    /// [`Self::reserve`].
    pub fn push(&self, lane: Lane, origin: &Arc<str>, points: Vec<Point>) {
        let Some(mut lanes) = self.lock() else {
            self.release(lane, points.len());
            return;
        };
        let mut seq = lanes.next_seq;
        let target = match lane {
            Lane::Static => &mut lanes.static_lane,
            Lane::Dynamic => &mut lanes.dynamic_lane,
        };
        for point in points {
            target.push_back(Queued {
                seq,
                origin: Arc::clone(origin),
                point,
            });
            seq += 1;
        }
        lanes.next_seq = seq;
        let queued = lanes.static_lane.len() + lanes.dynamic_lane.len();
        drop(lanes);

        if queued >= self.flush_threshold {
            self.request_flush();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock()
            .map_or(0, |l| l.static_lane.len() + l.dynamic_lane.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every queued point in submission order and frees the slots they held.
    pub fn drain(&self) -> Vec<Queued> {
        let Some(mut lanes) = self.lock() else {
            return Vec::new();
        };
        let mut static_lane = std::mem::take(&mut lanes.static_lane);
        let mut dynamic_lane = std::mem::take(&mut lanes.dynamic_lane);
        drop(lanes);

        self.release(Lane::Static, static_lane.len());
        self.release(Lane::Dynamic, dynamic_lane.len());

        let mut out = Vec::with_capacity(static_lane.len() + dynamic_lane.len());
        loop {
            let take_static = match (static_lane.front(), dynamic_lane.front()) {
                (Some(s), Some(d)) => s.seq < d.seq,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_static {
                static_lane.pop_front()
            } else {
                dynamic_lane.pop_front()
            };
            out.extend(next);
        }
        out
    }

    /// Wakes the Batcher ahead of its next tick.
    pub fn request_flush(&self) {
        self.flush.notify_one();
    }

    pub async fn flush_requested(&self) {
        self.flush.notified().await;
    }
}
