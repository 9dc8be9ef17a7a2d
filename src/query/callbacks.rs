//! Query result sinks: the planner streams tag-grouped datapoints into
//! one of these and `finish` shapes the response.
//!
//! Four pipelines: pass-through, per-series resampling, cross-series
//! aggregation, and their composition.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use tempo_core::{to_multi_map, KeyError, TagMultiMap, TagSet, Timestamp, Value};

use crate::model::Sampling;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unsupported aggregator: {0}")]
    UnsupportedAggregator(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// Aggregation functions over sample windows and aligned series.
///
/// `div`, `histogram`, `least_squares` and `rate` are reserved names and
/// rejected on selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Avg,
    Dev,
    Max,
    Min,
    Sum,
}

impl Aggregator {
    pub fn parse(name: &str) -> Result<Self, QueryError> {
        match name {
            "avg" => Ok(Aggregator::Avg),
            "dev" => Ok(Aggregator::Dev),
            "max" => Ok(Aggregator::Max),
            "min" => Ok(Aggregator::Min),
            "sum" => Ok(Aggregator::Sum),
            "div" | "histogram" | "least_squares" | "rate" => Err(
                QueryError::UnsupportedAggregator(format!("{name} is reserved")),
            ),
            other => Err(QueryError::UnsupportedAggregator(other.to_string())),
        }
    }

    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }

        match self {
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregator::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregator::Dev => {
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                let variance = values
                    .iter()
                    .map(|v| (v - mean) * (v - mean))
                    .sum::<f64>()
                    / values.len() as f64;
                variance.sqrt()
            }
        }
    }
}

/// One series of the response.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    pub name: String,
    pub tags: TagMultiMap,
    pub values: Vec<(Timestamp, Value)>,
}

/// Streaming sink fed by the gather step.
///
/// The planner brackets every tagset group with `start_datapoint_set` /
/// `end_datapoint_set`; `finish` is called once, after the last group.
pub trait QueryCallback: Send {
    fn start_datapoint_set(&mut self, tags: TagSet);
    fn add_data_point(&mut self, t: Timestamp, value: Value);
    fn end_datapoint_set(&mut self);
    fn finish(&mut self) -> Result<Vec<QueryResult>, QueryError>;
    fn sample_size(&self) -> usize;
}

fn single_tags(tags: &TagSet) -> TagMultiMap {
    tags.iter()
        .map(|(name, value)| (name.clone(), vec![value.clone()]))
        .collect()
}

/// Pass-through collector: values verbatim, one result per tagset group.
pub struct SimpleCallback {
    metric: String,
    results: Vec<QueryResult>,
    current: Option<(TagSet, Vec<(Timestamp, Value)>)>,
    sample_size: usize,
}

impl SimpleCallback {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            results: Vec::new(),
            current: None,
            sample_size: 0,
        }
    }
}

impl QueryCallback for SimpleCallback {
    fn start_datapoint_set(&mut self, tags: TagSet) {
        self.current = Some((tags, Vec::new()));
    }

    fn add_data_point(&mut self, t: Timestamp, value: Value) {
        if let Some((_, values)) = &mut self.current {
            values.push((t, value));
        }
    }

    fn end_datapoint_set(&mut self) {
        if let Some((tags, values)) = self.current.take() {
            self.sample_size += values.len();
            self.results.push(QueryResult {
                name: self.metric.clone(),
                tags: single_tags(&tags),
                values,
            });
        }
    }

    fn finish(&mut self) -> Result<Vec<QueryResult>, QueryError> {
        Ok(std::mem::take(&mut self.results))
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }
}

/// Numeric series collection shared by the resampling and aggregating
/// sinks. Non-numeric values poison the collection and fail the query at
/// `finish`.
struct NumericSets {
    sets: Vec<(TagSet, Vec<(Timestamp, f64)>)>,
    current: Option<(TagSet, Vec<(Timestamp, f64)>)>,
    sample_size: usize,
    error: Option<QueryError>,
}

impl NumericSets {
    fn new() -> Self {
        Self {
            sets: Vec::new(),
            current: None,
            sample_size: 0,
            error: None,
        }
    }

    fn start(&mut self, tags: TagSet) {
        self.current = Some((tags, Vec::new()));
    }

    fn add(&mut self, t: Timestamp, value: Value) {
        let Some((_, values)) = &mut self.current else {
            return;
        };

        match value.as_f64() {
            Some(v) => values.push((t, v)),
            None => {
                self.error.get_or_insert_with(|| {
                    QueryError::UnsupportedAggregator(
                        "aggregation over non-numeric values".to_string(),
                    )
                });
            }
        }
    }

    fn end(&mut self) {
        if let Some((tags, values)) = self.current.take() {
            self.sample_size += values.len();
            self.sets.push((tags, values));
        }
    }

    fn take(&mut self) -> Result<Vec<(TagSet, Vec<(Timestamp, f64)>)>, QueryError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        Ok(std::mem::take(&mut self.sets))
    }
}

/// Floor a timestamp to its bucket start.
fn bucket_of(t: Timestamp, width: Timestamp) -> Timestamp {
    t - t.rem_euclid(width)
}

/// Per-series downsampling: values bucketed to `sampling`-wide windows
/// aligned to multiples of the width, one aggregated point per non-empty
/// bucket.
pub struct ResamplingCallback {
    metric: String,
    how: Aggregator,
    bucket_ms: Timestamp,
    sets: NumericSets,
}

impl ResamplingCallback {
    pub fn new(
        metric: impl Into<String>,
        how: &str,
        sampling: &Sampling,
    ) -> Result<Self, QueryError> {
        Ok(Self {
            metric: metric.into(),
            how: Aggregator::parse(how)?,
            bucket_ms: sampling.bucket_millis(),
            sets: NumericSets::new(),
        })
    }

    /// Resampled series per tagset, ascending in time.
    fn resampled(&mut self) -> Result<Vec<(TagSet, BTreeMap<Timestamp, f64>)>, QueryError> {
        let sets = self.sets.take()?;

        Ok(sets
            .into_iter()
            .map(|(tags, values)| {
                let mut buckets: BTreeMap<Timestamp, Vec<f64>> = BTreeMap::new();
                for (t, v) in values {
                    buckets.entry(bucket_of(t, self.bucket_ms)).or_default().push(v);
                }

                let series = buckets
                    .into_iter()
                    .map(|(bucket, samples)| (bucket, self.how.apply(&samples)))
                    .collect();

                (tags, series)
            })
            .collect())
    }
}

impl QueryCallback for ResamplingCallback {
    fn start_datapoint_set(&mut self, tags: TagSet) {
        self.sets.start(tags);
    }

    fn add_data_point(&mut self, t: Timestamp, value: Value) {
        self.sets.add(t, value);
    }

    fn end_datapoint_set(&mut self) {
        self.sets.end();
    }

    fn finish(&mut self) -> Result<Vec<QueryResult>, QueryError> {
        let metric = self.metric.clone();

        Ok(self
            .resampled()?
            .into_iter()
            .map(|(tags, series)| QueryResult {
                name: metric.clone(),
                tags: single_tags(&tags),
                values: series
                    .into_iter()
                    .map(|(t, v)| (t, Value::Dec(v)))
                    .collect(),
            })
            .collect())
    }

    fn sample_size(&self) -> usize {
        self.sets.sample_size
    }
}

/// Linear interpolation inside a series' span; `None` outside it.
fn value_at(series: &BTreeMap<Timestamp, f64>, t: Timestamp) -> Option<f64> {
    if let Some(v) = series.get(&t) {
        return Some(*v);
    }

    let before = series.range(..t).next_back()?;
    let after = series.range(t..).next()?;

    let span = (after.0 - before.0) as f64;
    let fraction = (t - before.0) as f64 / span;
    Some(before.1 + (after.1 - before.1) * fraction)
}

fn combine_series(
    a: &BTreeMap<Timestamp, f64>,
    b: &BTreeMap<Timestamp, f64>,
    how: Aggregator,
) -> BTreeMap<Timestamp, f64> {
    let timestamps: std::collections::BTreeSet<Timestamp> =
        a.keys().chain(b.keys()).copied().collect();

    timestamps
        .into_iter()
        .filter_map(|t| {
            let va = value_at(a, t)?;
            let vb = value_at(b, t)?;
            Some((t, how.apply(&[va, vb])))
        })
        .collect()
}

/// Combine a list of per-tagset series into one, aligning timestamps
/// pairwise. `avg` sums and divides by the series count at the end.
fn aggregate_series(
    series: Vec<BTreeMap<Timestamp, f64>>,
    how: Aggregator,
) -> BTreeMap<Timestamp, f64> {
    let count = series.len();
    let combine_with = match how {
        Aggregator::Avg => Aggregator::Sum,
        other => other,
    };

    let mut iter = series.into_iter();
    let Some(mut combined) = iter.next() else {
        return BTreeMap::new();
    };

    for next in iter {
        combined = combine_series(&combined, &next, combine_with);
    }

    if how == Aggregator::Avg {
        for value in combined.values_mut() {
            *value /= count as f64;
        }
    }

    combined
}

/// Cross-series aggregation: all tagset groups collapse into a single
/// series whose tags are the multi-map union of the inputs.
pub struct AggregatingCallback {
    metric: String,
    how: Aggregator,
    sets: NumericSets,
}

impl AggregatingCallback {
    pub fn new(metric: impl Into<String>, how: &str) -> Result<Self, QueryError> {
        Ok(Self {
            metric: metric.into(),
            how: Aggregator::parse(how)?,
            sets: NumericSets::new(),
        })
    }

    fn finish_series(
        &mut self,
        sets: Vec<(TagSet, BTreeMap<Timestamp, f64>)>,
    ) -> Vec<QueryResult> {
        if sets.is_empty() {
            return Vec::new();
        }

        let tags = to_multi_map(sets.iter().map(|(tags, _)| tags));
        let series: Vec<_> = sets.into_iter().map(|(_, series)| series).collect();
        let combined = aggregate_series(series, self.how);

        vec![QueryResult {
            name: self.metric.clone(),
            tags,
            values: combined
                .into_iter()
                .map(|(t, v)| (t, Value::Dec(v)))
                .collect(),
        }]
    }
}

impl QueryCallback for AggregatingCallback {
    fn start_datapoint_set(&mut self, tags: TagSet) {
        self.sets.start(tags);
    }

    fn add_data_point(&mut self, t: Timestamp, value: Value) {
        self.sets.add(t, value);
    }

    fn end_datapoint_set(&mut self) {
        self.sets.end();
    }

    fn finish(&mut self) -> Result<Vec<QueryResult>, QueryError> {
        let sets = self
            .sets
            .take()?
            .into_iter()
            .map(|(tags, values)| (tags, values.into_iter().collect()))
            .collect();

        Ok(self.finish_series(sets))
    }

    fn sample_size(&self) -> usize {
        self.sets.sample_size
    }
}

/// Resample each series first, then aggregate across them.
pub struct ComplexCallback {
    resampler: ResamplingCallback,
    aggregator: AggregatingCallback,
}

impl ComplexCallback {
    pub fn new(resampler: ResamplingCallback, aggregator: AggregatingCallback) -> Self {
        Self {
            resampler,
            aggregator,
        }
    }
}

impl QueryCallback for ComplexCallback {
    fn start_datapoint_set(&mut self, tags: TagSet) {
        self.resampler.start_datapoint_set(tags);
    }

    fn add_data_point(&mut self, t: Timestamp, value: Value) {
        self.resampler.add_data_point(t, value);
    }

    fn end_datapoint_set(&mut self) {
        self.resampler.end_datapoint_set();
    }

    fn finish(&mut self) -> Result<Vec<QueryResult>, QueryError> {
        let resampled = self.resampler.resampled()?;
        Ok(self.aggregator.finish_series(resampled))
    }

    fn sample_size(&self) -> usize {
        self.resampler.sample_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn feed(
        callback: &mut dyn QueryCallback,
        groups: &[(&TagSet, &[(Timestamp, Value)])],
    ) -> Result<Vec<QueryResult>, QueryError> {
        for (group_tags, points) in groups {
            callback.start_datapoint_set((*group_tags).clone());
            for (t, v) in points.iter() {
                callback.add_data_point(*t, v.clone());
            }
            callback.end_datapoint_set();
        }
        callback.finish()
    }

    #[test]
    fn reserved_aggregators_are_rejected() {
        for name in ["div", "histogram", "least_squares", "rate", "median"] {
            assert!(matches!(
                Aggregator::parse(name),
                Err(QueryError::UnsupportedAggregator(_))
            ));
        }
    }

    #[test]
    fn simple_collects_groups_verbatim() {
        let t = tags(&[("host", "h1")]);
        let mut callback = SimpleCallback::new("cpu");

        let results = feed(
            &mut callback,
            &[(&t, &[(2000, Value::Int(2)), (1000, Value::Int(1))])],
        )
        .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "cpu");
        assert_eq!(results[0].tags["host"], vec!["h1"]);
        assert_eq!(
            results[0].values,
            vec![(2000, Value::Int(2)), (1000, Value::Int(1))]
        );
        assert_eq!(callback.sample_size(), 2);
    }

    #[test]
    fn resampling_buckets_align_to_unit_boundaries() {
        use crate::model::TimeUnit;

        let t = tags(&[]);
        let sampling = Sampling {
            value: 1,
            unit: TimeUnit::Seconds,
        };
        let mut callback = ResamplingCallback::new("cpu", "avg", &sampling).unwrap();

        let points: Vec<(Timestamp, Value)> = (0..6)
            .map(|i| (i * 200, Value::Int(i)))
            .collect();
        let results = feed(&mut callback, &[(&t, &points)]).unwrap();

        assert_eq!(
            results[0].values,
            vec![(0, Value::Dec(2.0)), (1000, Value::Dec(5.0))]
        );
    }

    #[test]
    fn aggregating_sums_across_tagsets() {
        let a = tags(&[("host", "h1")]);
        let b = tags(&[("host", "h2")]);
        let mut callback = AggregatingCallback::new("cpu", "sum").unwrap();

        let series_a: Vec<_> = [(0, 1), (1000, 2), (2000, 3)]
            .map(|(t, v)| (t, Value::Int(v)))
            .to_vec();
        let series_b: Vec<_> = [(0, 3), (1000, 2), (2000, 1)]
            .map(|(t, v)| (t, Value::Int(v)))
            .to_vec();

        let results = feed(&mut callback, &[(&a, &series_a), (&b, &series_b)]).unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tags["host"], vec!["h1", "h2"]);
        assert_eq!(
            results[0].values,
            vec![
                (0, Value::Dec(4.0)),
                (1000, Value::Dec(4.0)),
                (2000, Value::Dec(4.0))
            ]
        );
    }

    #[test]
    fn avg_divides_by_series_count() {
        let a = tags(&[("s", "a")]);
        let b = tags(&[("s", "b")]);
        let mut callback = AggregatingCallback::new("cpu", "avg").unwrap();

        let series_a = vec![(0, Value::Int(2)), (1000, Value::Int(4))];
        let series_b = vec![(0, Value::Int(4)), (1000, Value::Int(8))];

        let results = feed(&mut callback, &[(&a, &series_a), (&b, &series_b)]).unwrap();

        assert_eq!(
            results[0].values,
            vec![(0, Value::Dec(3.0)), (1000, Value::Dec(6.0))]
        );
    }

    #[test]
    fn misaligned_series_interpolate_inside_their_span() {
        let a = tags(&[("s", "a")]);
        let b = tags(&[("s", "b")]);
        let mut callback = AggregatingCallback::new("cpu", "sum").unwrap();

        // series b has no point at t=1000 but spans it
        let series_a = vec![(0, Value::Int(1)), (1000, Value::Int(1)), (2000, Value::Int(1))];
        let series_b = vec![(0, Value::Int(0)), (2000, Value::Int(2))];

        let results = feed(&mut callback, &[(&a, &series_a), (&b, &series_b)]).unwrap();

        assert_eq!(
            results[0].values,
            vec![
                (0, Value::Dec(1.0)),
                (1000, Value::Dec(2.0)),
                (2000, Value::Dec(3.0))
            ]
        );
    }

    #[test]
    fn non_numeric_values_fail_aggregation() {
        let t = tags(&[]);
        let mut callback = AggregatingCallback::new("cpu", "sum").unwrap();

        let result = feed(
            &mut callback,
            &[(&t, &[(0, Value::Str("up".into()))][..])],
        );

        assert!(matches!(
            result,
            Err(QueryError::UnsupportedAggregator(_))
        ));
    }

    #[test]
    fn complex_resamples_then_aggregates() {
        use crate::model::TimeUnit;

        let a = tags(&[("s", "a")]);
        let b = tags(&[("s", "b")]);

        let sampling = Sampling {
            value: 1,
            unit: TimeUnit::Seconds,
        };
        let resampler = ResamplingCallback::new("cpu", "avg", &sampling).unwrap();
        let aggregator = AggregatingCallback::new("cpu", "sum").unwrap();
        let mut callback = ComplexCallback::new(resampler, aggregator);

        // each series resamples to one point per second, then sums
        let series_a = vec![(0, Value::Int(1)), (500, Value::Int(3)), (1000, Value::Int(10))];
        let series_b = vec![(0, Value::Int(5)), (1000, Value::Int(20))];

        let results = feed(&mut callback, &[(&a, &series_a), (&b, &series_b)]).unwrap();

        assert_eq!(
            results[0].values,
            vec![(0, Value::Dec(7.0)), (1000, Value::Dec(30.0))]
        );
        assert_eq!(callback.sample_size(), 5);
    }

    #[test]
    fn dev_is_population_standard_deviation() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((Aggregator::Dev.apply(&values) - 2.0).abs() < 1e-9);
    }
}
