// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic pull of logging filters from Dataway.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dataway::Dataway;
use crate::filter::Filters;

#[derive(Debug, Clone)]
pub struct LogFilterPuller {
    dataway: Dataway,
    filters: Filters,
    interval: Duration,
}

impl LogFilterPuller {
    #[must_use]
    pub fn new(dataway: Dataway, filters: Filters, interval: Duration) -> Self {
        LogFilterPuller {
            dataway,
            filters,
            interval,
        }
    }

    /// One pull. Returns `true` when new rules were installed.
    pub async fn tick(&self) -> bool {
        let rules = match self.dataway.pull_log_filters().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("FILTER | failed to pull logging filters: {}", e);
                return false;
            }
        };
        let count = rules.len();
        match self.filters.update_remote(rules) {
            Ok(true) => {
                info!("FILTER | installed {} pulled logging conditions", count);
                true
            }
            Ok(false) => {
                debug!("FILTER | pulled logging filters unchanged");
                false
            }
            Err(e) => {
                warn!("FILTER | ignoring pulled logging filters: {}", e);
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.interval.is_zero() {
            return;
        }
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = self.tick() => {}
                    }
                }
            }
        }
        debug!("FILTER | log filter pull stopped");
    }
}
