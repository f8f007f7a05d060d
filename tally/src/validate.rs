//! Metric name and label key syntax checks
//!
//! The backend rejects custom metrics whose names or label keys fall outside
//! its documented character set and length limits. Checking up front turns a
//! submission failure, seen only by the error handler, into an error at
//! registration.

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest accepted metric name, in bytes.
pub const MAX_METRIC_NAME_LEN: usize = 200;
/// Longest accepted label key, in bytes.
pub const MAX_LABEL_KEY_LEN: usize = 100;

static METRIC_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9]((/[a-zA-Z0-9])?[a-zA-Z0-9._]*)*$")
        .expect("Invalid regex pattern provided")
});

static LABEL_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid regex pattern provided"));

/// Whether `name` is acceptable as the path part of a custom metric type.
#[must_use]
pub fn is_valid_metric_name(name: &str) -> bool {
    name.len() <= MAX_METRIC_NAME_LEN && METRIC_NAME.is_match(name)
}

/// Whether `key` is acceptable as a metric label key.
#[must_use]
pub fn is_valid_label_key(key: &str) -> bool {
    key.len() <= MAX_LABEL_KEY_LEN && LABEL_KEY.is_match(key)
}
