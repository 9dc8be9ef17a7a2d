//! Wire-facing data model: datapoint payloads, query requests, and
//! credentials.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tempo_core::{TagFilter, TagSet, Timestamp, Value};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid datapoint payload: {0}")]
    InvalidDataPoint(String),
}

/// A single measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

/// A named series of measurements sharing one tagset.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointSet {
    pub name: String,
    pub tags: TagSet,
    pub points: Vec<DataPoint>,
}

#[derive(Deserialize)]
struct RawDataPointSet {
    name: String,
    #[serde(default)]
    tags: TagSet,
    timestamp: Option<Timestamp>,
    value: Option<serde_json::Value>,
    datapoints: Option<Vec<(Timestamp, serde_json::Value)>>,
}

impl DataPointSet {
    /// Parse the put payload: a list of metric entries carrying either a
    /// single `{timestamp, value}` pair or a `datapoints` array.
    pub fn from_json(json: serde_json::Value) -> Result<Vec<DataPointSet>, ModelError> {
        let raw: Vec<RawDataPointSet> = serde_json::from_value(json)
            .map_err(|e| ModelError::InvalidDataPoint(e.to_string()))?;

        raw.into_iter()
            .map(|entry| {
                let points = match (entry.timestamp, entry.value, entry.datapoints) {
                    (Some(timestamp), Some(value), _) => vec![DataPoint {
                        timestamp,
                        value: value.into(),
                    }],
                    (_, _, Some(datapoints)) => datapoints
                        .into_iter()
                        .map(|(timestamp, value)| DataPoint {
                            timestamp,
                            value: value.into(),
                        })
                        .collect(),
                    _ => {
                        return Err(ModelError::InvalidDataPoint(format!(
                            "metric {} has neither timestamp/value nor datapoints",
                            entry.name
                        )))
                    }
                };

                Ok(DataPointSet {
                    name: entry.name,
                    tags: entry.tags,
                    points,
                })
            })
            .collect()
    }
}

/// Downsampling units and their millisecond widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    pub fn millis(&self) -> Timestamp {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1000,
            TimeUnit::Minutes => 1000 * 60,
            TimeUnit::Hours => 1000 * 60 * 60,
            TimeUnit::Days => 1000 * 60 * 60 * 24,
            TimeUnit::Weeks => 1000 * 60 * 60 * 24 * 7,
            TimeUnit::Months => 1000 * 60 * 60 * 24 * 30,
            TimeUnit::Years => 1000 * 60 * 60 * 24 * 365,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelativeTime {
    pub value: i64,
    pub unit: TimeUnit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sampling {
    pub value: i64,
    pub unit: TimeUnit,
}

impl Sampling {
    pub fn bucket_millis(&self) -> Timestamp {
        self.value * self.unit.millis()
    }
}

/// Downsample instruction: aggregator name plus sampling width.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Downsample {
    pub name: String,
    pub sampling: Sampling,
}

/// Tag filter values arrive either as a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// One metric inside a query request.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricQuery {
    pub name: String,

    #[serde(default)]
    pub tags: std::collections::BTreeMap<String, OneOrMany>,

    pub aggregate: Option<String>,

    pub downsample: Option<Downsample>,
}

impl MetricQuery {
    pub fn tag_filter(&self) -> TagFilter {
        self.tags
            .iter()
            .map(|(name, values)| {
                let values = match values {
                    OneOrMany::One(v) => [v.clone()].into(),
                    OneOrMany::Many(vs) => vs.iter().cloned().collect(),
                };
                (name.clone(), values)
            })
            .collect()
    }
}

/// The query envelope: a shared time interval plus per-metric criteria.
///
/// Start and end may be absolute epoch millis or relative to now; absent
/// bounds default to now.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub start_absolute: Option<Timestamp>,
    pub start_relative: Option<RelativeTime>,
    pub end_absolute: Option<Timestamp>,
    pub end_relative: Option<RelativeTime>,

    pub metrics: Vec<MetricQuery>,
}

impl QueryRequest {
    fn calc_time(
        now: Timestamp,
        absolute: Option<Timestamp>,
        relative: Option<RelativeTime>,
    ) -> Timestamp {
        if let Some(t) = absolute {
            return t;
        }
        if let Some(rel) = relative {
            return now - rel.value * rel.unit.millis();
        }
        now
    }

    pub fn time_interval(&self, now: Timestamp) -> (Timestamp, Timestamp) {
        (
            Self::calc_time(now, self.start_absolute, self.start_relative),
            Self::calc_time(now, self.end_absolute, self.end_relative),
        )
    }
}

/// A row of the credentials catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub state: String,
    pub permissions: Vec<String>,
}

impl Credential {
    pub fn is_active(&self) -> bool {
        self.state == "ACTIVE"
    }
}
