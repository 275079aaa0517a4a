//! Structural comparison of actual outputs against declarative expectations
//!
//! Everything here is pure: the same inputs always produce the same list of
//! [`AssertionError`]s, and an empty list means the check passed. Every
//! discrepancy is collected; nothing short-circuits on the first mismatch.
//!
//! Nested JSON expectations map a key either to a literal (compared with
//! numeric-aware equality), to a nested object (recursed into), or to a
//! predicate object. A predicate object is a mapping holding at least one of
//! the keys in [`PREDICATE_KEYS`]; only the first key present, in that
//! order, is evaluated.

use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::spec::{CliExpectation, Expectation, FileExpect};

/// Predicate keys in evaluation order
pub const PREDICATE_KEYS: [&str; 7] = ["exists", "contains", "type", "gt", "lt", "gte", "lte"];

/// Placeholder reported when a field is absent
pub const MISSING: &str = "<missing>";

/// Maximum characters of a body or stream quoted in an error
const EXCERPT_LEN: usize = 200;
const FILE_EXCERPT_LEN: usize = 100;

/// A single discrepancy between expectation and reality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionError {
    /// Dotted path of the checked field; empty for whole-document failures
    pub field: String,
    pub expected: Value,
    pub actual: Value,
    /// Replaces the formatted form when set
    pub message: Option<String>,
}

impl AssertionError {
    fn new(field: impl Into<String>, expected: impl Into<Value>, actual: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
            message: None,
        }
    }

    fn message(field: impl Into<String>, message: String) -> Self {
        Self {
            field: field.into(),
            expected: Value::Null,
            actual: Value::Null,
            message: Some(message),
        }
    }

    fn missing(field: &str, expected: impl Into<Value>) -> Self {
        Self::new(field, expected, MISSING)
    }
}

impl fmt::Display for AssertionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => f.write_str(message),
            None => write!(
                f,
                "{}: expected {}, got {}",
                self.field,
                render(&self.expected),
                render(&self.actual)
            ),
        }
    }
}

impl std::error::Error for AssertionError {}

/// An HTTP response as seen by the assertion engine
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    /// Deserialize the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// The body as (lossy) UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Check an HTTP response against an expectation
pub fn assert_response(response: &Response, expect: &Expectation) -> Vec<AssertionError> {
    let mut errors = Vec::new();

    if expect.status != 0 && response.status != expect.status {
        errors.push(AssertionError::new("status", expect.status, response.status));
    }

    for (key, expected) in &expect.headers {
        let actual = response
            .headers
            .get(key.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if actual != expected {
            errors.push(AssertionError::new(
                format!("header[{key}]"),
                expected.as_str(),
                actual,
            ));
        }
    }

    let body = response.text();

    if !expect.body_contains.is_empty() && !body.contains(&expect.body_contains) {
        errors.push(AssertionError::new(
            "body",
            format!("contains {:?}", expect.body_contains),
            truncate(&body, EXCERPT_LEN),
        ));
    }

    if !expect.body_equals.is_empty() && body != expect.body_equals {
        errors.push(AssertionError::new(
            "body",
            truncate(&expect.body_equals, EXCERPT_LEN),
            truncate(&body, EXCERPT_LEN),
        ));
    }

    if !expect.json.is_empty() {
        match serde_json::from_slice::<Map<String, Value>>(&response.body) {
            Ok(actual) => assert_json_fields(&actual, &expect.json, "", &mut errors),
            Err(e) => errors.push(AssertionError::message(
                "",
                format!("failed to parse response as JSON: {e}"),
            )),
        }
    }

    errors
}

/// Check captured process output against an expectation
pub fn assert_cli_output(
    stdout: &str,
    stderr: &str,
    exit_code: i32,
    expect: &CliExpectation,
) -> Vec<AssertionError> {
    let mut errors = Vec::new();

    if exit_code != expect.exit_code {
        errors.push(AssertionError::new("exit_code", expect.exit_code, exit_code));
    }

    check_stream("stdout", stdout, &expect.stdout_contains, &expect.stdout_equals, &mut errors);
    check_stream("stderr", stderr, &expect.stderr_contains, &expect.stderr_equals, &mut errors);

    errors
}

fn check_stream(
    field: &str,
    actual: &str,
    contains: &str,
    equals: &str,
    errors: &mut Vec<AssertionError>,
) {
    if !contains.is_empty() && !actual.contains(contains) {
        errors.push(AssertionError::new(
            field,
            format!("contains {contains:?}"),
            truncate(actual, EXCERPT_LEN),
        ));
    }
    if !equals.is_empty() && actual != equals {
        errors.push(AssertionError::new(
            field,
            truncate(equals, EXCERPT_LEN),
            truncate(actual, EXCERPT_LEN),
        ));
    }
}

/// Check files left behind by a CLI case, relative to its working directory
pub fn assert_files(root: &Path, files: &BTreeMap<String, FileExpect>) -> Vec<AssertionError> {
    let mut errors = Vec::new();

    for (rel, expect) in files {
        let field = format!("file {rel}");
        let path = root.join(rel);
        match std::fs::read(&path) {
            Ok(content) => {
                if !expect.exists {
                    errors.push(AssertionError::message(
                        &field,
                        format!("{field}: expected not to exist but it does"),
                    ));
                    continue;
                }
                let content = String::from_utf8_lossy(&content);
                if !expect.contains.is_empty() && !content.contains(&expect.contains) {
                    errors.push(AssertionError::message(
                        &field,
                        format!(
                            "{field}: expected to contain {:?} but content is {:?}",
                            expect.contains,
                            truncate(&content, FILE_EXCERPT_LEN)
                        ),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if expect.exists {
                    errors.push(AssertionError::message(
                        &field,
                        format!("{field}: expected to exist but does not"),
                    ));
                }
            }
            Err(e) => errors.push(AssertionError::message(&field, format!("{field}: {e}"))),
        }
    }

    errors
}

/// Recursively compare `expected` field expectations against `actual`
pub fn assert_json_fields(
    actual: &Map<String, Value>,
    expected: &Map<String, Value>,
    prefix: &str,
    errors: &mut Vec<AssertionError>,
) {
    for (key, expected_value) in expected {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        let actual_value = actual.get(key);

        if let Value::Object(spec) = expected_value {
            if let Some(predicate) = Predicate::from_object(spec) {
                if let Some(error) = predicate.evaluate(&path, actual_value, expected_value) {
                    errors.push(error);
                }
                continue;
            }

            match actual_value {
                Some(Value::Object(nested)) => assert_json_fields(nested, spec, &path, errors),
                Some(other) => errors.push(AssertionError::new(
                    path,
                    "object",
                    json_type(other),
                )),
                None => errors.push(AssertionError::missing(&path, expected_value.clone())),
            }
            continue;
        }

        match actual_value {
            None => errors.push(AssertionError::missing(&path, expected_value.clone())),
            Some(actual_value) if !values_equal(actual_value, expected_value) => {
                errors.push(AssertionError::new(
                    path,
                    expected_value.clone(),
                    actual_value.clone(),
                ));
            }
            Some(_) => {}
        }
    }
}

/// A predicate decoded from an expectation object
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate<'a> {
    Exists(bool),
    Contains(&'a Value),
    Type(&'a Value),
    Gt(&'a Value),
    Lt(&'a Value),
    Gte(&'a Value),
    Lte(&'a Value),
}

impl<'a> Predicate<'a> {
    /// Decode the governing predicate, if `spec` is a predicate object at all
    pub fn from_object(spec: &'a Map<String, Value>) -> Option<Self> {
        let (key, value) = PREDICATE_KEYS
            .iter()
            .find_map(|key| spec.get(*key).map(|value| (*key, value)))?;

        Some(match key {
            // Non-boolean values read as `false`
            "exists" => Predicate::Exists(value.as_bool().unwrap_or(false)),
            "contains" => Predicate::Contains(value),
            "type" => Predicate::Type(value),
            "gt" => Predicate::Gt(value),
            "lt" => Predicate::Lt(value),
            "gte" => Predicate::Gte(value),
            _ => Predicate::Lte(value),
        })
    }

    /// Evaluate against the value found at `path`, if any.
    ///
    /// `spec` is the whole predicate object, reported when the field is
    /// missing.
    pub fn evaluate(
        &self,
        path: &str,
        actual: Option<&Value>,
        spec: &Value,
    ) -> Option<AssertionError> {
        if let Predicate::Exists(should_exist) = *self {
            return match (should_exist, actual) {
                (true, None) => Some(AssertionError::missing(path, "exists")),
                (false, Some(actual)) => {
                    Some(AssertionError::new(path, "not exists", actual.clone()))
                }
                _ => None,
            };
        }

        let Some(actual) = actual else {
            return Some(AssertionError::missing(path, spec.clone()));
        };

        match *self {
            Predicate::Exists(_) => None,
            Predicate::Contains(needle) => {
                let needle = render(needle);
                let haystack = render(actual);
                (!haystack.contains(&needle)).then(|| {
                    AssertionError::new(path, format!("contains {needle:?}"), haystack)
                })
            }
            Predicate::Type(expected) => {
                let expected = render(expected);
                let actual_type = json_type(actual);
                (actual_type != expected).then(|| {
                    AssertionError::new(
                        path,
                        format!("type {expected}"),
                        format!("type {actual_type}"),
                    )
                })
            }
            Predicate::Gt(bound) => compare(path, actual, bound, ">", |a, b| a > b),
            Predicate::Lt(bound) => compare(path, actual, bound, "<", |a, b| a < b),
            Predicate::Gte(bound) => compare(path, actual, bound, ">=", |a, b| a >= b),
            Predicate::Lte(bound) => compare(path, actual, bound, "<=", |a, b| a <= b),
        }
    }
}

fn compare(
    path: &str,
    actual: &Value,
    bound: &Value,
    op: &str,
    holds: impl Fn(f64, f64) -> bool,
) -> Option<AssertionError> {
    let Some(bound_num) = as_number(bound) else {
        return Some(AssertionError::message(
            path,
            format!("{path}: bound for {op} is not a number: {}", render(bound)),
        ));
    };

    match as_number(actual) {
        Some(actual_num) if holds(actual_num, bound_num) => None,
        _ => Some(AssertionError::new(
            path,
            format!("{op} {}", format_number(bound_num)),
            actual.clone(),
        )),
    }
}

/// JSON type name as used by the `type` predicate
pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Structural equality where numbers compare by value, so `5 == 5.0`
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => as_number(a) == as_number(b),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn format_number(n: f64) -> String {
    format!("{n}")
}

/// Strings print bare, everything else as compact JSON
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shorten `s` to at most `max_len` bytes on a char boundary, marking the cut
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Join all messages with `"; "`; the empty string means pass
pub fn format_errors(errors: &[AssertionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
