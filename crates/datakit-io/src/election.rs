// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Leader election and ingestion-time tagging.
//!
//! [`ElectionState`] is a shared flag flipped by the [`Candidate`] loop. The
//! [`TagInjector`] reads it at the ingestion gateway: with election enabled, points of
//! cluster-singleton categories (or feeds marked `election`) are only admitted on the
//! leader. Every admitted point is stamped with the local `host` tag.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ELECTION_NAMESPACE_TAG};
use crate::dataway::{Dataway, SendError};
use crate::point::{Category, Point};

pub const HOST_TAG: &str = "host";

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("election request failed: {0}")]
    Request(#[from] SendError),
    #[error("unexpected election response: {0}")]
    Response(String),
    #[error("no dataway target to campaign against")]
    NoTarget,
}

#[derive(Clone, Debug, Default)]
pub struct ElectionState {
    leader: Arc<AtomicBool>,
}

impl ElectionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_leader(&self, leader: bool) -> bool {
        self.leader.swap(leader, Ordering::AcqRel)
    }
}

#[derive(Clone, Debug)]
pub struct TagInjector {
    hostname: String,
    enabled: bool,
    global_host_tags: BTreeMap<String, String>,
    election_tags: BTreeMap<String, String>,
    state: ElectionState,
}

impl TagInjector {
    #[must_use]
    pub fn new(config: &Config, state: ElectionState) -> Self {
        let mut election_tags = config.election.tags.clone();
        if config.election.enable && config.election.enable_namespace_tag {
            election_tags.insert(
                ELECTION_NAMESPACE_TAG.to_string(),
                config.election.namespace.clone(),
            );
        }
        TagInjector {
            hostname: config.hostname.clone(),
            enabled: config.election.enable,
            global_host_tags: config.global_host_tags.clone(),
            election_tags,
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    #[must_use]
    pub fn is_election_feed(category: Category, election: bool) -> bool {
        election || category.is_singleton()
    }

    /// `false` when the feed must be dropped because this instance is not the leader.
    #[must_use]
    pub fn admits(&self, category: Category, election: bool) -> bool {
        !self.enabled || !Self::is_election_feed(category, election) || self.state.is_leader()
    }

    /// Stamps the identity and global tags. Producer tags win over global ones; `host`
    /// always reflects this instance.
    pub fn inject(&self, category: Category, election: bool, point: &mut Point) {
        if self.enabled && Self::is_election_feed(category, election) {
            for (k, v) in &self.election_tags {
                point.add_tag_if_absent(k, v);
            }
        }
        for (k, v) in &self.global_host_tags {
            point.add_tag_if_absent(k, v);
        }
        point.set_tag(HOST_TAG, &self.hostname);
    }
}

#[derive(Debug, Deserialize)]
struct ElectionResponse {
    content: ElectionContent,
}

#[derive(Debug, Deserialize)]
struct ElectionContent {
    status: String,
}

fn parse_status(body: &str) -> Result<bool, ElectionError> {
    let resp: ElectionResponse = serde_json::from_str(body)
        .map_err(|e| ElectionError::Response(format!("{e}: {body}")))?;
    match resp.content.status.as_str() {
        "success" => Ok(true),
        "fail" => Ok(false),
        other => Err(ElectionError::Response(format!("unknown status '{other}'"))),
    }
}

/// Campaigns against the first Dataway target and keeps [`ElectionState`] current.
#[derive(Debug, Clone)]
pub struct Candidate {
    dataway: Dataway,
    namespace: String,
    id: String,
    interval: Duration,
    state: ElectionState,
}

impl Candidate {
    #[must_use]
    pub fn new(config: &Config, dataway: Dataway, state: ElectionState) -> Self {
        Candidate {
            dataway,
            namespace: config.election.namespace.clone(),
            id: config.hostname.clone(),
            interval: config.election.interval,
            state,
        }
    }

    async fn post(&self, heartbeat: bool) -> Result<bool, ElectionError> {
        let target = self.dataway.targets().first().ok_or(ElectionError::NoTarget)?;
        let url = if heartbeat {
            target.heartbeat_url(&self.namespace, &self.id)
        } else {
            target.election_url(&self.namespace, &self.id)
        };
        let body = self.dataway.post_control(url).await?;
        parse_status(&body)
    }

    pub async fn campaign(&self) -> Result<bool, ElectionError> {
        self.post(false).await
    }

    pub async fn heartbeat(&self) -> Result<bool, ElectionError> {
        self.post(true).await
    }

    /// One round: heartbeat when leading, campaign otherwise. Errors demote.
    pub async fn tick(&self) -> bool {
        let leading = self.state.is_leader();
        let result = if leading {
            self.heartbeat().await
        } else {
            self.campaign().await
        };
        let leader = match result {
            Ok(leader) => leader,
            Err(e) => {
                let action = if leading { "heartbeat" } else { "campaign" };
                warn!("ELECTION | {} failed: {}", action, e);
                false
            }
        };
        let was_leader = self.state.set_leader(leader);
        match (was_leader, leader) {
            (false, true) => info!(
                "ELECTION | {} is now leader of namespace {}",
                self.id, self.namespace
            ),
            (true, false) => info!(
                "ELECTION | {} lost leadership of namespace {}",
                self.id, self.namespace
            ),
            _ => debug!("ELECTION | leader={} namespace={}", leader, self.namespace),
        }
        leader
    }

    pub async fn run(self, cancel: CancellationToken) {
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
        self.state.set_leader(false);
        debug!("ELECTION | candidate stopped");
    }
}
