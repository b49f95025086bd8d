// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The typed record every producer emits.
//!
//! A [`Point`] is built through [`PointBuilder`], which enforces the structural limits
//! the upstream accepts. Once built, a point only changes inside the ingestion gateway,
//! which owns the vector handed to `feed` and stamps identity tags before the point is
//! queued.

pub mod category;
pub mod line_protocol;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use category::Category;

pub const MAX_TAGS: usize = 256;
pub const MAX_FIELDS: usize = 1024;
pub const MAX_TAG_KEY_LEN: usize = 256;
pub const MAX_TAG_VALUE_LEN: usize = 1024;
pub const MAX_FIELD_KEY_LEN: usize = 256;
pub const MAX_FIELD_VALUE_LEN: usize = 32 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum PointError {
    #[error("measurement name is empty")]
    EmptyMeasurement,
    #[error("point has no fields")]
    NoFields,
    #[error("too many tags: {count} > {max}")]
    TooManyTags { count: usize, max: usize },
    #[error("too many fields: {count} > {max}")]
    TooManyFields { count: usize, max: usize },
    #[error("empty tag or field key")]
    EmptyKey,
    #[error("tag key '{0}' exceeds {MAX_TAG_KEY_LEN} bytes")]
    TagKeyTooLong(String),
    #[error("value of tag '{0}' exceeds {MAX_TAG_VALUE_LEN} bytes")]
    TagValueTooLong(String),
    #[error("field key '{0}' exceeds {MAX_FIELD_KEY_LEN} bytes")]
    FieldKeyTooLong(String),
    #[error("key '{key}' contains '.', not allowed for category {category}")]
    DottedKey { key: String, category: Category },
    #[error("key '{0}' used as both tag and field")]
    TagFieldConflict(String),
}

/// A typed field value. `Null` is an explicit "no value" and is skipped on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
}

impl FieldValue {
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FieldValue::Str(s) => s.trim().parse().ok(),
            FieldValue::Null => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    fn size_hint(&self) -> usize {
        match self {
            FieldValue::Int(_) | FieldValue::Float(_) => 20,
            FieldValue::Bool(_) => 5,
            FieldValue::Str(s) => s.len() + 2,
            FieldValue::Null => 0,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => FieldValue::Int(v),
            #[allow(clippy::cast_precision_loss)]
            Err(_) => FieldValue::Float(v as f64),
        }
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::from(v as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float(f64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the Unix epoch.
    time: i64,
}

impl Point {
    #[must_use]
    pub fn builder(measurement: impl Into<String>) -> PointBuilder {
        PointBuilder::new(measurement)
    }

    /// Validates like [`PointBuilder::build`]. `time` defaults to now.
    pub fn new(
        category: Category,
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Option<SystemTime>,
    ) -> Result<Point, PointError> {
        let mut builder = PointBuilder::new(measurement).category(category);
        builder.tags = tags;
        builder.fields = fields;
        builder.time = time.map(system_time_nanos);
        builder.build()
    }

    #[must_use]
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn time_nanos(&self) -> i64 {
        self.time
    }

    /// Re-runs the builder checks against the category the point is fed under, after
    /// the pipeline added its own tags.
    pub fn validate(&self, category: Category) -> Result<(), PointError> {
        check(category, &self.measurement, &self.tags, &self.fields)
    }

    /// Rough wire size, used for batch and cache accounting.
    #[must_use]
    pub fn size_hint(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum();
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| k.len() + v.size_hint() + 2)
            .sum();
        self.measurement.len() + tags + fields + 21
    }

    /// Overwrites any producer-supplied value.
    pub(crate) fn set_tag(&mut self, key: &str, value: &str) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    /// Adds the tag unless the producer already set it.
    pub(crate) fn add_tag_if_absent(&mut self, key: &str, value: &str) {
        if !self.tags.contains_key(key) {
            self.tags.insert(key.to_string(), value.to_string());
        }
    }
}

/// A higher-level record that knows how to render itself as a [`Point`].
pub trait Measurement: Send + Sync {
    fn to_point(&self) -> Result<Point, PointError>;
}

impl Measurement for Point {
    fn to_point(&self) -> Result<Point, PointError> {
        Ok(self.clone())
    }
}

impl<T: Measurement + ?Sized> Measurement for Box<T> {
    fn to_point(&self) -> Result<Point, PointError> {
        (**self).to_point()
    }
}

#[derive(Debug, Clone)]
pub struct PointBuilder {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    time: Option<i64>,
    category: Category,
}

impl PointBuilder {
    #[must_use]
    pub fn new(measurement: impl Into<String>) -> Self {
        PointBuilder {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: None,
            category: Category::Metric,
        }
    }

    /// Category the point is destined for; tightens key validation for non-metric data.
    #[must_use]
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn time(mut self, time: SystemTime) -> Self {
        self.time = Some(system_time_nanos(time));
        self
    }

    #[must_use]
    pub fn time_nanos(mut self, nanos: i64) -> Self {
        self.time = Some(nanos);
        self
    }

    pub fn build(self) -> Result<Point, PointError> {
        check(self.category, &self.measurement, &self.tags, &self.fields)?;

        let fields = self
            .fields
            .into_iter()
            .map(|(k, v)| match v {
                FieldValue::Str(s) if s.len() > MAX_FIELD_VALUE_LEN => {
                    (k, FieldValue::Str(truncate_utf8(s, MAX_FIELD_VALUE_LEN)))
                }
                other => (k, other),
            })
            .collect();

        Ok(Point {
            measurement: self.measurement,
            tags: self.tags,
            fields,
            time: self.time.unwrap_or_else(now_nanos),
        })
    }
}

fn check(
    category: Category,
    measurement: &str,
    tags: &BTreeMap<String, String>,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<(), PointError> {
    if measurement.is_empty() {
        return Err(PointError::EmptyMeasurement);
    }
    if fields.is_empty() {
        return Err(PointError::NoFields);
    }
    if tags.len() > MAX_TAGS {
        return Err(PointError::TooManyTags {
            count: tags.len(),
            max: MAX_TAGS,
        });
    }
    if fields.len() > MAX_FIELDS {
        return Err(PointError::TooManyFields {
            count: fields.len(),
            max: MAX_FIELDS,
        });
    }

    for (key, value) in tags {
        check_key(category, key)?;
        if key.len() > MAX_TAG_KEY_LEN {
            return Err(PointError::TagKeyTooLong(key.clone()));
        }
        if value.len() > MAX_TAG_VALUE_LEN {
            return Err(PointError::TagValueTooLong(key.clone()));
        }
        if fields.contains_key(key) {
            return Err(PointError::TagFieldConflict(key.clone()));
        }
    }
    for key in fields.keys() {
        check_key(category, key)?;
        if key.len() > MAX_FIELD_KEY_LEN {
            return Err(PointError::FieldKeyTooLong(key.clone()));
        }
    }
    Ok(())
}

fn check_key(category: Category, key: &str) -> Result<(), PointError> {
    if key.is_empty() {
        return Err(PointError::EmptyKey);
    }
    if !category.allows_dotted_keys() && key.contains('.') {
        return Err(PointError::DottedKey {
            key: key.to_string(),
            category,
        });
    }
    Ok(())
}

fn truncate_utf8(mut s: String, max: usize) -> String {
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}

fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

#[must_use]
pub fn now_nanos() -> i64 {
    system_time_nanos(SystemTime::now())
}

/// An ordered run of same-category points produced by one Batcher flush.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub category: Category,
    pub origin: String,
    pub points: Vec<Point>,
    pub size_bytes: usize,
}

impl Batch {
    #[must_use]
    pub fn new(category: Category, origin: impl Into<String>, points: Vec<Point>) -> Self {
        let size_bytes = points.iter().map(Point::size_hint).sum();
        Batch {
            category,
            origin: origin.into(),
            points,
            size_bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
