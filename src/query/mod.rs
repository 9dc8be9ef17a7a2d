//! The fan-out query pipeline: index scan, parallel per-key range
//! queries on the reader pool, and an ordered gather into a callback.

use std::sync::{mpsc, Arc};

use tracing::warn;

use tempo_core::{IndexKey, KvStore, TagFilter, TagMultiMap, Timestamp, WorkerPool};

use crate::schema::{Schema, SchemaError};

pub mod callbacks;

pub use callbacks::{
    AggregatingCallback, Aggregator, ComplexCallback, QueryCallback, QueryError, QueryResult,
    ResamplingCallback, SimpleCallback,
};

/// Matching index keys for a query, in block-walk order.
fn matching_index_keys<S: KvStore>(
    schema: &Schema<S>,
    domain: &str,
    metric: &str,
    start: Timestamp,
    end: Timestamp,
    filter: &TagFilter,
) -> Result<Vec<IndexKey>, SchemaError> {
    let keys = schema.query_index(domain, metric, start, end)?;

    let mut matching = Vec::with_capacity(keys.len());
    for key in keys {
        if filter.is_empty() || key.has_tags(filter)? {
            matching.push(key);
        }
    }

    Ok(matching)
}

/// Run a full datapoint query through `callback`.
///
/// One task per surviving index key goes to the reader pool; the gather
/// step joins them strictly in creation order, so consecutive keys with
/// the same tag string stream into one datapoint set. `finish` is left
/// to the caller.
pub fn execute_query<S: KvStore>(
    schema: &Arc<Schema<S>>,
    readers: &WorkerPool,
    domain: &str,
    metric: &str,
    start: Timestamp,
    end: Timestamp,
    filter: &TagFilter,
    callback: &mut dyn QueryCallback,
) -> Result<(), SchemaError> {
    let keys = matching_index_keys(schema, domain, metric, start, end, filter)?;

    let mut tasks = Vec::with_capacity(keys.len());
    for key in keys {
        let (tx, rx) = mpsc::channel();
        let schema = Arc::clone(schema);
        let task_key = key.clone();

        readers.execute(move || {
            let points = schema
                .query_datapoints(&task_key, start, end)
                .unwrap_or_else(|error| {
                    warn!(%error, "datapoint query task failed");
                    Vec::new()
                });
            let _ = tx.send(points);
        });

        tasks.push((key, rx));
    }

    let mut open = false;
    let mut last_tag_string: Option<String> = None;

    for (key, rx) in tasks {
        let tag_string = key.tag_string()?.to_string();

        if last_tag_string.as_deref() != Some(tag_string.as_str()) {
            if open {
                callback.end_datapoint_set();
            }
            callback.start_datapoint_set(key.tags()?.clone());
            open = true;
            last_tag_string = Some(tag_string);
        }

        for (t, value) in rx.recv().unwrap_or_default() {
            callback.add_data_point(t, value);
        }
    }

    if open {
        callback.end_datapoint_set();
    }

    Ok(())
}

/// Index-only variant: the multi-map union of every matching tagset,
/// without touching the datapoint tables.
pub fn query_metric_tags<S: KvStore>(
    schema: &Schema<S>,
    domain: &str,
    metric: &str,
    start: Timestamp,
    end: Timestamp,
    filter: &TagFilter,
) -> Result<TagMultiMap, SchemaError> {
    let keys = matching_index_keys(schema, domain, metric, start, end, filter)?;

    let mut tagsets = Vec::with_capacity(keys.len());
    for key in &keys {
        tagsets.push(key.tags()?.clone());
    }

    Ok(tempo_core::to_multi_map(tagsets.iter()))
}
