//! Synthetic measurement series for exercising the write and query paths.

use tempo_core::{TagSet, Timestamp, Value};

/// One named series: a metric, its tagset, and evenly spaced points.
#[derive(Clone, Debug)]
pub struct SeriesFixture {
    pub metric: String,
    pub tags: TagSet,
    pub points: Vec<(Timestamp, Value)>,
}

impl SeriesFixture {
    /// `count` integer points starting at `start`, `step` ms apart, with
    /// values produced by `f(i)`.
    pub fn ramp(
        metric: &str,
        tags: TagSet,
        start: Timestamp,
        step: Timestamp,
        count: usize,
        f: impl Fn(usize) -> i64,
    ) -> Self {
        let points = (0..count)
            .map(|i| (start + i as Timestamp * step, Value::Int(f(i))))
            .collect();

        Self {
            metric: metric.to_string(),
            tags,
            points,
        }
    }

    /// A constant-valued series.
    pub fn constant(
        metric: &str,
        tags: TagSet,
        start: Timestamp,
        step: Timestamp,
        count: usize,
        value: i64,
    ) -> Self {
        Self::ramp(metric, tags, start, step, count, move |_| value)
    }
}
