// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited line-protocol encoding of points.
//!
//! `measurement,tag1=v1,tag2=v2 field1=v1,field2="s" timestamp`

use serde::Deserialize;
use std::fmt::Write;

use crate::point::{FieldValue, Point};

/// Unit the timestamps are rendered in. Sent upstream as the `precision` query parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

impl Precision {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Precision::Ns => "ns",
            Precision::Us => "us",
            Precision::Ms => "ms",
            Precision::S => "s",
        }
    }

    const fn divisor(self) -> i64 {
        match self {
            Precision::Ns => 1,
            Precision::Us => 1_000,
            Precision::Ms => 1_000_000,
            Precision::S => 1_000_000_000,
        }
    }
}

/// Encode a batch body: one line per point, newline terminated.
#[must_use]
pub fn encode(points: &[Point], precision: Precision) -> Vec<u8> {
    let mut out = String::with_capacity(points.iter().map(Point::size_hint).sum());
    for point in points {
        if encode_point(point, precision, &mut out) {
            out.push('\n');
        }
    }
    out.into_bytes()
}

/// Appends one line (without the trailing newline). Returns `false` and leaves `out`
/// untouched when every field is `Null` or non-finite.
pub fn encode_point(point: &Point, precision: Precision, out: &mut String) -> bool {
    let start = out.len();

    escape_into(out, point.measurement(), &[',', ' ']);
    for (key, value) in point.tags() {
        out.push(',');
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        escape_into(out, value, &[',', '=', ' ']);
    }

    let mut wrote_field = false;
    for (key, value) in point.fields() {
        let sep = if wrote_field { ',' } else { ' ' };
        match value {
            FieldValue::Null => continue,
            FieldValue::Float(f) if !f.is_finite() => continue,
            _ => {}
        }
        out.push(sep);
        escape_into(out, key, &[',', '=', ' ']);
        out.push('=');
        match value {
            FieldValue::Int(i) => {
                let _ = write!(out, "{i}i");
            }
            FieldValue::Float(f) => {
                let _ = write!(out, "{f}");
            }
            FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            FieldValue::Str(s) => {
                out.push('"');
                escape_into(out, s, &['"', '\\']);
                out.push('"');
            }
            FieldValue::Null => {}
        }
        wrote_field = true;
    }

    if !wrote_field {
        out.truncate(start);
        return false;
    }

    let _ = write!(out, " {}", point.time_nanos() / precision.divisor());
    true
}

fn escape_into(out: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        match c {
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}
