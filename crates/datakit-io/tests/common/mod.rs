// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stateful Dataway stand-in for pipeline tests.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
    Router,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const HEALTHY: u8 = 0;
pub const DOWN: u8 = 1;
pub const HANG: u8 = 2;

#[derive(Debug, Clone)]
pub struct Received {
    pub category: String,
    pub query: HashMap<String, String>,
    pub lines: Vec<String>,
}

#[derive(Default)]
struct Backend {
    mode: AtomicU8,
    attempts: AtomicUsize,
    received: Mutex<Vec<Received>>,
}

#[derive(Clone)]
pub struct MockDataway {
    backend: Arc<Backend>,
    pub url: String,
}

async fn write(
    State(backend): State<Arc<Backend>>,
    Path(category): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    backend.attempts.fetch_add(1, Ordering::SeqCst);
    match backend.mode.load(Ordering::SeqCst) {
        DOWN => return StatusCode::SERVICE_UNAVAILABLE,
        HANG => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return StatusCode::GATEWAY_TIMEOUT;
        }
        _ => {}
    }
    let lines = String::from_utf8_lossy(&body)
        .lines()
        .map(str::to_string)
        .collect();
    backend.received.lock().expect("lock").push(Received {
        category,
        query,
        lines,
    });
    StatusCode::OK
}

impl MockDataway {
    pub async fn start(mode: u8) -> Self {
        let backend = Arc::new(Backend::default());
        backend.mode.store(mode, Ordering::SeqCst);
        let app = Router::new()
            .route("/v1/write/:category", post(write))
            .with_state(Arc::clone(&backend));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock dataway");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("mock dataway failed");
        });
        MockDataway {
            backend,
            url: format!("http://{addr}?token=tkn_test"),
        }
    }

    pub fn set_mode(&self, mode: u8) {
        self.backend.mode.store(mode, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.backend.attempts.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.backend.received.lock().expect("lock").clone()
    }

    /// Every accepted line of `category`, in arrival order.
    pub fn lines(&self, category: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|r| r.category == category)
            .flat_map(|r| r.lines)
            .collect()
    }
}

/// Polls `cond` every 20ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// The `n` field of a `measurement n=<n>i <ts>` line.
pub fn field_n(line: &str) -> Option<i64> {
    line.split(' ')
        .find_map(|part| part.strip_prefix("n="))
        .and_then(|v| v.trim_end_matches('i').parse().ok())
}
