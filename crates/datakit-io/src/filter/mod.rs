// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-category blacklist filters.
//!
//! Each category holds an ordered list of conditions written in a small expression
//! language:
//!
//! ```text
//! { source = 'datakit' and host in ['h1', 'h2'] }; { status >= 500 }
//! ```
//!
//! A point is dropped when it matches **any** condition of its category. Conditions are
//! compiled once when the configuration is loaded; a malformed condition is a
//! configuration error, never a runtime one. Logging conditions pulled from Dataway
//! ([`pull::LogFilterPuller`]) are compiled on arrival and swapped into [`Filters`]; a
//! malformed pull is logged and the previous rules stay active.
//!
//! # Lookup rules
//!
//! An identifier resolves to a tag first, then a field. `measurement` and `source`
//! fall back to the measurement name when no tag or field of that name exists. A
//! comparison against a missing or incomparable value is false, except `key = nil`,
//! which is true for a missing key or a `Null` field.

mod lexer;
mod parser;
pub mod pull;

use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::point::{Category, FieldValue, Point};

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid filter condition '{condition}' at offset {offset}: {message}")]
    Parse {
        condition: String,
        offset: usize,
        message: String,
    },
    #[error("invalid regular expression '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Nil,
}

#[derive(Debug)]
pub(crate) enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Cmp {
        key: String,
        op: CmpOp,
        value: Literal,
    },
    In {
        key: String,
        values: Vec<Literal>,
        negate: bool,
    },
    Match {
        key: String,
        patterns: Vec<Regex>,
        negate: bool,
    },
}

/// Borrowed view of the value an identifier resolves to.
#[derive(Clone, Copy)]
enum Value<'a> {
    Text(&'a str),
    Field(&'a FieldValue),
    Missing,
}

impl<'a> Value<'a> {
    fn lookup(point: &'a Point, key: &str) -> Value<'a> {
        if let Some(tag) = point.tag(key) {
            return Value::Text(tag);
        }
        if let Some(field) = point.field(key) {
            return Value::Field(field);
        }
        if key == "measurement" || key == "source" {
            return Value::Text(point.measurement());
        }
        Value::Missing
    }

    fn as_str(self) -> Option<&'a str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Field(FieldValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            Value::Text(s) => s.trim().parse().ok(),
            Value::Field(f) => f.as_f64(),
            Value::Missing => None,
        }
    }

    fn is_nil(self) -> bool {
        matches!(self, Value::Missing | Value::Field(FieldValue::Null))
    }

    fn compare(self, literal: &Literal) -> Option<Ordering> {
        match literal {
            Literal::Str(expected) => self.as_str().map(|s| s.cmp(expected.as_str())),
            Literal::Num(expected) => self.as_f64()?.partial_cmp(expected),
            Literal::Bool(expected) => {
                let actual = match self {
                    Value::Field(FieldValue::Bool(b)) => *b,
                    Value::Text(s) => s.parse().ok()?,
                    _ => return None,
                };
                Some(actual.cmp(expected))
            }
            Literal::Nil => None,
        }
    }

    fn equals(self, literal: &Literal) -> bool {
        match literal {
            Literal::Nil => self.is_nil(),
            other => self.compare(other) == Some(Ordering::Equal),
        }
    }
}

impl Expr {
    fn matches(&self, point: &Point) -> bool {
        match self {
            Expr::And(terms) => terms.iter().all(|t| t.matches(point)),
            Expr::Or(terms) => terms.iter().any(|t| t.matches(point)),
            Expr::Cmp { key, op, value } => {
                let actual = Value::lookup(point, key);
                if let Literal::Nil = value {
                    return match op {
                        CmpOp::Eq => actual.is_nil(),
                        _ => !actual.is_nil(),
                    };
                }
                let Some(ordering) = actual.compare(value) else {
                    return false;
                };
                match op {
                    CmpOp::Eq => ordering == Ordering::Equal,
                    CmpOp::Ne => ordering != Ordering::Equal,
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Ge => ordering != Ordering::Less,
                }
            }
            Expr::In {
                key,
                values,
                negate,
            } => {
                let actual = Value::lookup(point, key);
                if matches!(actual, Value::Missing) {
                    return false;
                }
                let found = values.iter().any(|v| actual.equals(v));
                found != *negate
            }
            Expr::Match {
                key,
                patterns,
                negate,
            } => {
                let Some(text) = Value::lookup(point, key).as_str() else {
                    return false;
                };
                let found = patterns.iter().any(|re| re.is_match(text));
                found != *negate
            }
        }
    }
}

/// One compiled condition plus the text it came from.
#[derive(Debug)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a condition list such as `{a > 1}; {b = 'x'}`.
    pub fn parse_all(text: &str) -> Result<Vec<Condition>, FilterError> {
        Ok(parser::parse_conditions(text)?
            .into_iter()
            .map(|expr| Condition {
                source: text.trim().to_string(),
                expr,
            })
            .collect())
    }

    #[must_use]
    pub fn matches(&self, point: &Point) -> bool {
        self.expr.matches(point)
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Compiled conditions for every category.
#[derive(Debug, Default)]
pub struct FilterSet {
    by_category: [Vec<Condition>; Category::ALL.len()],
}

impl FilterSet {
    pub fn compile(rules: &HashMap<Category, Vec<String>>) -> Result<Self, FilterError> {
        let mut set = FilterSet::default();
        for (category, conditions) in rules {
            for text in conditions {
                set.by_category[category.index()].extend(Condition::parse_all(text)?);
            }
        }
        Ok(set)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_category.iter().all(Vec::is_empty)
    }

    #[must_use]
    pub fn conditions(&self, category: Category) -> &[Condition] {
        &self.by_category[category.index()]
    }

    /// True when the point matches any condition configured for its category.
    #[must_use]
    pub fn should_drop(&self, category: Category, point: &Point) -> bool {
        self.by_category[category.index()]
            .iter()
            .any(|c| c.matches(point))
    }

    /// Removes matching points in place and returns how many were dropped.
    pub fn apply(&self, category: Category, points: &mut Vec<Point>) -> usize {
        let conditions = &self.by_category[category.index()];
        if conditions.is_empty() {
            return 0;
        }
        let before = points.len();
        points.retain(|p| match conditions.iter().find(|c| c.matches(p)) {
            Some(condition) => {
                debug!(
                    "FILTER | dropped {} point '{}' on '{}'",
                    category,
                    p.measurement(),
                    condition.source()
                );
                false
            }
            None => true,
        });
        before - points.len()
    }
}

#[derive(Debug, Default)]
struct Active {
    remote: Vec<String>,
    set: Arc<FilterSet>,
}

/// Configured rules plus the logging rules last pulled from Dataway. Feeds read a
/// snapshot; an update swaps in a freshly compiled [`FilterSet`].
#[derive(Debug, Clone)]
pub struct Filters {
    local: Arc<HashMap<Category, Vec<String>>>,
    active: Arc<RwLock<Active>>,
}

impl Filters {
    pub fn new(local: HashMap<Category, Vec<String>>) -> Result<Self, FilterError> {
        let set = FilterSet::compile(&local)?;
        Ok(Filters {
            local: Arc::new(local),
            active: Arc::new(RwLock::new(Active {
                remote: Vec::new(),
                set: Arc::new(set),
            })),
        })
    }

    #[must_use]
    pub fn current(&self) -> Arc<FilterSet> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&active.set)
    }

    /// Replaces the pulled logging rules. Returns `Ok(false)` when they are unchanged;
    /// on error the active rules are kept.
    pub fn update_remote(&self, rules: Vec<String>) -> Result<bool, FilterError> {
        {
            let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
            if active.remote == rules {
                return Ok(false);
            }
        }
        let mut merged = (*self.local).clone();
        merged
            .entry(Category::Logging)
            .or_default()
            .extend(rules.iter().cloned());
        let set = FilterSet::compile(&merged)?;

        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = Active {
            remote: rules,
            set: Arc::new(set),
        };
        Ok(true)
    }
}
