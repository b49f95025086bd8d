// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::dataway::Dataway;

/// Reports the agent alive to every Dataway target on a fixed interval.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    dataway: Dataway,
    id: String,
    host: String,
    interval: Duration,
}

impl Heartbeat {
    #[must_use]
    pub fn new(config: &Config, dataway: Dataway) -> Self {
        Heartbeat {
            dataway,
            id: config.hostname.clone(),
            host: config.hostname.clone(),
            interval: config.dataway.heartbeat_interval,
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
                        report = self.dataway.heartbeat(&self.id, &self.host) => {
                            debug!("DATAWAY | heartbeat accepted: {}", report.delivered());
                        }
                    }
                }
            }
        }
        debug!("DATAWAY | heartbeat stopped");
    }
}
