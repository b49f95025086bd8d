// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Secondary, best-effort destinations.
//!
//! A [`SinkDescriptor`] is a free-form key/value map (`target` names the adapter,
//! `categories` restricts which batches it receives). Descriptors are resolved once at
//! startup through a [`SinkRegistry`] into [`Sink`] instances owned by the
//! [`SinkRouter`]. Sink failures are logged and counted; they never influence Dataway
//! delivery or caching.

pub mod file;
pub mod http;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::point::{Batch, Category, Point};
use crate::stats::Stats;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sink request failed: {0}")]
    Http(String),
    #[error("invalid sink descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("no sink creator registered for target '{0}'")]
    UnknownTarget(String),
    #[error("sink creator for target '{0}' already registered")]
    DuplicateTarget(String),
}

#[async_trait]
pub trait Sink: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Categories this sink accepts; empty means all.
    fn categories(&self) -> &[Category];

    async fn write(&self, category: Category, points: &[Point]) -> Result<(), SinkError>;
}

/// The JSON shape written by the built-in sinks.
#[derive(Debug, Serialize)]
pub(crate) struct JsonPoint<'a> {
    measurement: &'a str,
    tags: &'a BTreeMap<String, String>,
    fields: &'a BTreeMap<String, crate::point::FieldValue>,
    time: i64,
}

impl<'a> From<&'a Point> for JsonPoint<'a> {
    fn from(point: &'a Point) -> Self {
        JsonPoint {
            measurement: point.measurement(),
            tags: point.tags(),
            fields: point.fields(),
            time: point.time_nanos(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkDescriptor(BTreeMap<String, Value>);

impl SinkDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.get_str("target")
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Accepts a list or a comma separated string of category names or short names.
    /// Unknown names are logged and skipped.
    #[must_use]
    pub fn categories(&self) -> Vec<Category> {
        let names: Vec<&str> = match self.0.get("categories") {
            Some(Value::String(s)) => s.split(',').collect(),
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        let mut categories = Vec::new();
        for name in names.into_iter().map(str::trim).filter(|n| !n.is_empty()) {
            match name.parse::<Category>() {
                Ok(c) if !categories.contains(&c) => categories.push(c),
                Ok(_) => {}
                Err(e) => warn!("SINK | {}, ignoring", e),
            }
        }
        categories
    }

    /// Parses an `ENV_SINK_<X>` value: `k=v,k=v` pairs, several sinks separated by `||`.
    #[must_use]
    pub fn parse_env(category: Category, value: &str) -> Vec<Self> {
        value
            .split("||")
            .filter(|s| !s.trim().is_empty())
            .filter_map(|raw| {
                let mut descriptor = SinkDescriptor::new();
                for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
                    let Some((k, v)) = pair.split_once('=') else {
                        error!("SINK | Malformed sink option '{}', expected key=value", pair);
                        return None;
                    };
                    descriptor = descriptor.with(k.trim(), v.trim());
                }
                Some(descriptor.with("categories", vec![category.short_name()]))
            })
            .collect()
    }
}

pub type SinkCreator =
    Box<dyn Fn(&SinkDescriptor) -> Result<Arc<dyn Sink>, SinkError> + Send + Sync>;

/// Sink factories keyed by `target`, populated by the composition root.
#[derive(Default)]
pub struct SinkRegistry {
    creators: HashMap<String, SinkCreator>,
}

impl SinkRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `file` and `http` sinks.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&str, SinkCreator); 2] = [
            (file::TARGET, Box::new(file::FileSink::create)),
            (http::TARGET, Box::new(http::HttpSink::create)),
        ];
        for (target, creator) in builtin {
            registry.creators.insert(target.to_string(), creator);
        }
        registry
    }

    pub fn add_creator(
        &mut self,
        target: impl Into<String>,
        creator: SinkCreator,
    ) -> Result<(), SinkError> {
        let target = target.into();
        if self.creators.contains_key(&target) {
            return Err(SinkError::DuplicateTarget(target));
        }
        self.creators.insert(target, creator);
        Ok(())
    }

    pub fn create(&self, descriptor: &SinkDescriptor) -> Result<Arc<dyn Sink>, SinkError> {
        let target = descriptor
            .target()
            .ok_or_else(|| SinkError::InvalidDescriptor("missing 'target'".to_string()))?;
        let creator = self
            .creators
            .get(target)
            .ok_or_else(|| SinkError::UnknownTarget(target.to_string()))?;
        creator(descriptor)
    }
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("targets", &self.creators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SinkRouter {
    by_category: Arc<[Vec<Arc<dyn Sink>>; Category::ALL.len()]>,
    stats: Arc<Stats>,
}

impl SinkRouter {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Sink>>, stats: Arc<Stats>) -> Self {
        let mut by_category: [Vec<Arc<dyn Sink>>; Category::ALL.len()] = Default::default();
        for sink in sinks {
            let categories = if sink.categories().is_empty() {
                Category::ALL.to_vec()
            } else {
                sink.categories().to_vec()
            };
            for category in categories {
                by_category[category.index()].push(Arc::clone(&sink));
            }
        }
        SinkRouter {
            by_category: Arc::new(by_category),
            stats,
        }
    }

    /// Resolves descriptors; invalid ones are logged and skipped.
    #[must_use]
    pub fn from_descriptors(
        registry: &SinkRegistry,
        descriptors: &[SinkDescriptor],
        stats: Arc<Stats>,
    ) -> Self {
        let mut sinks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match registry.create(descriptor) {
                Ok(sink) => {
                    info!(
                        "SINK | Registered sink {} for {:?}",
                        sink.id(),
                        sink.categories()
                    );
                    sinks.push(sink);
                }
                Err(e) => error!("SINK | Skipping sink {:?}: {}", descriptor, e),
            }
        }
        Self::new(sinks, stats)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_category.iter().all(Vec::is_empty)
    }

    #[must_use]
    pub fn sinks_for(&self, category: Category) -> &[Arc<dyn Sink>] {
        &self.by_category[category.index()]
    }

    /// Writes the batch to every matching sink concurrently. Returns the number of
    /// sinks that failed.
    pub async fn route(&self, batch: &Batch) -> usize {
        let sinks = self.sinks_for(batch.category);
        if sinks.is_empty() || batch.is_empty() {
            return 0;
        }
        let results = join_all(
            sinks
                .iter()
                .map(|sink| sink.write(batch.category, &batch.points)),
        )
        .await;

        let mut failed = 0;
        for (sink, result) in sinks.iter().zip(results) {
            match result {
                Ok(()) => debug!(
                    "SINK | {} points of {} written to {}",
                    batch.len(),
                    batch.category,
                    sink.id()
                ),
                Err(e) => {
                    failed += 1;
                    warn!(
                        "SINK | Failed to write {} points of {} to {}: {}",
                        batch.len(),
                        batch.category,
                        sink.id(),
                        e
                    );
                }
            }
        }
        if failed > 0 {
            Stats::add(&self.stats.category(batch.category).sink_failures, failed);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Recording {
        id: String,
        categories: Vec<Category>,
        fail: bool,
        seen: Mutex<Vec<(Category, usize)>>,
    }

    #[async_trait]
    impl Sink for Recording {
        fn id(&self) -> &str {
            &self.id
        }

        fn categories(&self) -> &[Category] {
            &self.categories
        }

        async fn write(&self, category: Category, points: &[Point]) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Http("unreachable".to_string()));
            }
            self.seen
                .lock()
                .expect("lock")
                .push((category, points.len()));
            Ok(())
        }
    }

    fn recording(id: &str, categories: Vec<Category>, fail: bool) -> Arc<Recording> {
        Arc::new(Recording {
            id: id.to_string(),
            categories,
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn batch(category: Category, n: usize) -> Batch {
        let points = (0..n)
            .map(|i| {
                Point::builder("m")
                    .category(category)
                    .field("n", i)
                    .build()
                    .expect("valid point")
            })
            .collect();
        Batch::new(category, "test", points)
    }

    #[test]
    fn test_descriptor_categories() {
        let d = SinkDescriptor::new().with("categories", "M, logging,bogus,M");
        assert_eq!(d.categories(), vec![Category::Metric, Category::Logging]);
        let d = SinkDescriptor::new().with("categories", vec!["CO", "/v1/write/rum"]);
        assert_eq!(d.categories(), vec![Category::CustomObject, Category::Rum]);
        assert!(SinkDescriptor::new().categories().is_empty());
    }

    #[test]
    fn test_parse_env() {
        let sinks = SinkDescriptor::parse_env(
            Category::Logging,
            "target=file,path=/tmp/l.json || target=http,url=http://x/y||broken",
        );
        assert_eq!(sinks.len(), 2);
        assert_eq!(sinks[0].get_str("path"), Some("/tmp/l.json"));
        assert_eq!(sinks[1].target(), Some("http"));
        assert_eq!(sinks[1].categories(), vec![Category::Logging]);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_targets() {
        let mut registry = SinkRegistry::with_builtin();
        let err = registry
            .add_creator(file::TARGET, Box::new(file::FileSink::create))
            .expect_err("duplicate");
        assert!(matches!(err, SinkError::DuplicateTarget(_)));

        let err = registry
            .create(&SinkDescriptor::new().with("target", "influxdb"))
            .expect_err("unknown");
        assert!(matches!(err, SinkError::UnknownTarget(_)));
        let err = registry.create(&SinkDescriptor::new()).expect_err("no target");
        assert!(matches!(err, SinkError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn test_route_matches_category_and_counts_failures() {
        let stats = Arc::new(Stats::default());
        let metrics = recording("metrics", vec![Category::Metric], false);
        let everything = recording("everything", vec![], false);
        let broken = recording("broken", vec![Category::Metric], true);
        let sinks: Vec<Arc<dyn Sink>> = vec![metrics.clone(), everything.clone(), broken];
        let router = SinkRouter::new(sinks, Arc::clone(&stats));

        assert_eq!(router.route(&batch(Category::Metric, 3)).await, 1);
        assert_eq!(router.route(&batch(Category::Logging, 2)).await, 0);

        assert_eq!(
            *metrics.seen.lock().expect("lock"),
            vec![(Category::Metric, 3)]
        );
        assert_eq!(
            *everything.seen.lock().expect("lock"),
            vec![(Category::Metric, 3), (Category::Logging, 2)]
        );
        let snapshot = stats.snapshot(crate::stats::ChanStat::default());
        assert_eq!(snapshot.categories[&Category::Metric].sink_failures, 1);
        assert_eq!(snapshot.categories[&Category::Logging].sink_failures, 0);
    }

    #[test]
    fn test_from_descriptors_skips_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("m.json");
        let descriptors = vec![
            SinkDescriptor::new()
                .with("target", "file")
                .with("path", path.to_string_lossy().to_string())
                .with("categories", "M"),
            SinkDescriptor::new().with("target", "nope"),
            SinkDescriptor::new().with("target", "file"),
        ];
        let router = SinkRouter::from_descriptors(
            &SinkRegistry::with_builtin(),
            &descriptors,
            Arc::new(Stats::default()),
        );
        assert_eq!(router.sinks_for(Category::Metric).len(), 1);
        assert!(router.sinks_for(Category::Logging).is_empty());
        assert!(!router.is_empty());
    }
}
