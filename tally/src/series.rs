//! Time series data submitted to the backend
//!
//! These types mirror the monitoring backend's JSON mapping: camelCase field
//! names, RFC 3339 timestamps and 64-bit integers encoded as decimal strings.

use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use serde::{Serialize, Serializer, ser};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::counter::Window;

/// Root under which every custom metric type lives.
pub const CUSTOM_METRIC_ROOT: &str = "custom.googleapis.com";

/// The identity of a metric: its type and label set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Metric {
    /// Fully qualified metric type, e.g. `custom.googleapis.com/planes`.
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Metric labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Metric {
    /// A custom metric called `name` with `labels`.
    #[must_use]
    pub fn custom(name: &str, labels: BTreeMap<String, String>) -> Self {
        Self {
            metric_type: format!("{CUSTOM_METRIC_ROOT}/{name}"),
            labels,
        }
    }
}

/// The entity a time series is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoredResource {
    /// Resource type name, e.g. `global`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Identifying labels, always including `project_id`.
    pub labels: BTreeMap<String, String>,
}

/// How a metric's points relate to one another over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    /// Each point is a total over its own interval.
    Cumulative,
}

/// The span of time a point covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeInterval {
    /// Inclusive start.
    #[serde(serialize_with = "rfc3339")]
    pub start_time: SystemTime,
    /// End of the interval.
    #[serde(serialize_with = "rfc3339")]
    pub end_time: SystemTime,
}

/// The value of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TypedValue {
    /// A 64-bit integer.
    #[serde(rename = "int64Value", serialize_with = "decimal_string")]
    Int64(u64),
}

/// A single data point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    /// The time span the value covers.
    pub interval: TimeInterval,
    /// The value.
    pub value: TypedValue,
}

impl From<&Window> for Point {
    /// Convert a drained window into a point.
    ///
    /// The end time is pulled back one millisecond: consecutive intervals of
    /// one series must not touch, the next start has to be at least a
    /// millisecond after the previous end.
    fn from(window: &Window) -> Self {
        Self {
            interval: TimeInterval {
                start_time: window.start,
                end_time: window.end - Duration::from_millis(1),
            },
            value: TypedValue::Int64(window.total),
        }
    }
}

/// A metric, its resource and its points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    /// Metric identity.
    pub metric: Metric,
    /// Always cumulative for counters.
    pub metric_kind: MetricKind,
    /// The resource the series belongs to.
    pub resource: MonitoredResource,
    /// Exactly one point per series in a request.
    pub points: Vec<Point>,
}

/// One submission to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTimeSeriesRequest {
    /// Project path, `projects/<project_id>`.
    #[serde(skip)]
    pub name: String,
    /// At most one series per metric identity.
    pub time_series: Vec<TimeSeries>,
}

impl CreateTimeSeriesRequest {
    /// Total number of points in the request.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.time_series.iter().map(|ts| ts.points.len()).sum()
    }
}

/// The request name for a project.
#[must_use]
pub fn project_path(project_id: &str) -> String {
    format!("projects/{project_id}")
}

fn rfc3339<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = OffsetDateTime::from(*time)
        .format(&Rfc3339)
        .map_err(ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn decimal_string<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(value)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        time::{Duration, UNIX_EPOCH},
    };

    use serde_json::json;

    use super::{
        CreateTimeSeriesRequest, Metric, MetricKind, MonitoredResource, Point, TimeSeries,
        TypedValue, project_path,
    };
    use crate::{clock::from_unix_seconds, counter::Window};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn window_end_is_pulled_back_one_millisecond() {
        let window = Window {
            start: from_unix_seconds(1_672_693_348),
            end: from_unix_seconds(1_672_693_408),
            total: 365,
        };
        let point = Point::from(&window);

        assert_eq!(point.interval.start_time, from_unix_seconds(1_672_693_348));
        assert_eq!(
            point.interval.end_time,
            UNIX_EPOCH + Duration::new(1_672_693_407, 999_000_000)
        );
        assert_eq!(point.value, TypedValue::Int64(365));
    }

    #[test]
    fn custom_metric_type() {
        let metric = Metric::custom("planes", labels(&[("model", "737-800")]));
        assert_eq!(metric.metric_type, "custom.googleapis.com/planes");
        assert_eq!(metric.labels["model"], "737-800");
    }

    #[test]
    fn serializes_to_backend_json() {
        let window = Window {
            start: from_unix_seconds(1_672_693_348),
            end: from_unix_seconds(1_672_693_408),
            total: 365,
        };
        let request = CreateTimeSeriesRequest {
            name: project_path("tally"),
            time_series: vec![TimeSeries {
                metric: Metric::custom("test-metric", labels(&[("colour", "red")])),
                metric_kind: MetricKind::Cumulative,
                resource: MonitoredResource {
                    resource_type: "global".to_string(),
                    labels: labels(&[("project_id", "tally")]),
                },
                points: vec![Point::from(&window)],
            }],
        };

        assert_eq!(request.name, "projects/tally");
        assert_eq!(request.point_count(), 1);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "timeSeries": [{
                    "metric": {
                        "type": "custom.googleapis.com/test-metric",
                        "labels": { "colour": "red" }
                    },
                    "metricKind": "CUMULATIVE",
                    "resource": {
                        "type": "global",
                        "labels": { "project_id": "tally" }
                    },
                    "points": [{
                        "interval": {
                            "startTime": "2023-01-02T21:02:28Z",
                            "endTime": "2023-01-02T21:03:27.999Z"
                        },
                        "value": { "int64Value": "365" }
                    }]
                }]
            })
        );
    }

    #[test]
    fn metric_without_labels_omits_them() {
        let metric = Metric::custom("bare", BTreeMap::new());
        assert_eq!(
            serde_json::to_value(&metric).unwrap(),
            serde_json::json!({ "type": "custom.googleapis.com/bare" })
        );
    }
}
