//! Deterministic cache keys for report queries.
//!
//! A [`Fingerprint`] is an endpoint name plus the canonical encoding of the
//! query parameters. The encoding sorts keys, treats numeric strings as the
//! numbers they spell, and length-prefixes every string so two distinct
//! parameter maps can never encode to the same text.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

/// Reporting endpoints served through the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    StudentPerformance,
    AllStudentsPerformance,
    AtRisk,
    StudentSubjects,
    SchoolYearSummary,
    ClassAverage,
}

impl Endpoint {
    pub const ALL: [Endpoint; 6] = [
        Endpoint::StudentPerformance,
        Endpoint::AllStudentsPerformance,
        Endpoint::AtRisk,
        Endpoint::StudentSubjects,
        Endpoint::SchoolYearSummary,
        Endpoint::ClassAverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::StudentPerformance => "student_performance",
            Endpoint::AllStudentsPerformance => "all_students_performance",
            Endpoint::AtRisk => "at_risk",
            Endpoint::StudentSubjects => "student_subjects",
            Endpoint::SchoolYearSummary => "school_year_summary",
            Endpoint::ClassAverage => "class_average",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters of a report request.
///
/// `None` values are dropped, so an absent optional parameter and an
/// omitted one fingerprint the same.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    values: BTreeMap<String, Value>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add a parameter unless it is `None`.
    pub fn with_opt<V: Into<Value>>(mut self, key: impl Into<String>, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(key, value);
        }
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical text form of the parameters.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        encode_object(self.values.iter(), &mut out);
        out
    }
}

impl From<Map<String, Value>> for QueryParams {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            values: map.into_iter().collect(),
        }
    }
}

/// Cache key of one report query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    endpoint: String,
    params: String,
}

impl Fingerprint {
    /// Fingerprint an arbitrary endpoint name.
    pub fn new(endpoint: impl Into<String>, params: &QueryParams) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: params.canonical(),
        }
    }

    pub fn for_endpoint(endpoint: Endpoint, params: &QueryParams) -> Self {
        Self::new(endpoint.as_str(), params)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Canonical parameter encoding.
    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn belongs_to(&self, endpoint: &str) -> bool {
        self.endpoint == endpoint
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.endpoint, self.params)
    }
}

// ============================================================================
// CANONICAL ENCODING
// ============================================================================

fn encode_object<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>, out: &mut String) {
    let mut sorted: Vec<(&String, &Value)> = entries.collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    out.push('{');
    for (i, (key, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_str(key, out);
        out.push('=');
        encode_value(value, out);
    }
    out.push('}');
}

fn encode_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push('n'),
        Value::Bool(true) => out.push_str("t"),
        Value::Bool(false) => out.push_str("f"),
        Value::Number(number) => encode_number(number, out),
        Value::String(s) => match numeric_string(s) {
            Some(number) => encode_number(&number, out),
            None => {
                out.push('s');
                encode_str(s, out);
            }
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => encode_object(map.iter(), out),
    }
}

/// Length-prefixed string: `<byte length>:<raw>`.
fn encode_str(s: &str, out: &mut String) {
    let _ = write!(out, "{}:{}", s.len(), s);
}

/// Numbers encode as `#<integer>` when integral, otherwise `#<shortest float>`.
fn encode_number(number: &Number, out: &mut String) {
    if let Some(i) = number.as_i64() {
        let _ = write!(out, "#{}", i);
    } else if let Some(u) = number.as_u64() {
        let _ = write!(out, "#{}", u);
    } else if let Some(f) = number.as_f64() {
        encode_float(f, out);
    }
}

fn encode_float(f: f64, out: &mut String) {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        let _ = write!(out, "#{}", f as i64);
    } else {
        let _ = write!(out, "#{}", f);
    }
}

/// A string that spells a finite number.
fn numeric_string(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    if let Ok(u) = s.parse::<u64>() {
        return Some(Number::from(u));
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
}
