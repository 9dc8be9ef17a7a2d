//! Tenant-aware facade over the schema and query pipeline.
//!
//! One datastore per process; it holds no per-domain state. The domain
//! travels as an argument and isolation is a property of the row keys.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use tempo_core::{KvStore, QueryConfig, TagMultiMap, Timestamp, WorkerPool};

use crate::model::{DataPointSet, MetricQuery, ModelError};
use crate::query::{
    self, AggregatingCallback, ComplexCallback, QueryCallback, QueryError, QueryResult,
    ResamplingCallback, SimpleCallback,
};
use crate::schema::{Schema, SchemaError};

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One metric's query response: the results plus how many raw samples
/// went into them.
#[derive(Debug, Serialize)]
pub struct QueryOutcome {
    pub sample_size: usize,
    pub results: Vec<QueryResult>,
}

pub struct Datastore<S: KvStore> {
    schema: Arc<Schema<S>>,
    readers: WorkerPool,
}

impl<S: KvStore> Datastore<S> {
    pub fn new(schema: Schema<S>, query: &QueryConfig) -> Self {
        Self {
            schema: Arc::new(schema),
            readers: WorkerPool::new(query.readers),
        }
    }

    pub fn schema(&self) -> &Arc<Schema<S>> {
        &self.schema
    }

    /// Store every point of a set under the given domain.
    pub fn put_data_points(&self, domain: &str, set: &DataPointSet) {
        for point in &set.points {
            self.schema.store_datapoint(
                point.timestamp,
                &set.name,
                &set.tags,
                point.value.clone(),
                domain,
            );
        }
    }

    /// Pick the callback pipeline a query asks for.
    fn create_callback(query: &MetricQuery) -> Result<Box<dyn QueryCallback>, QueryError> {
        let aggregator = query
            .aggregate
            .as_deref()
            .map(|how| AggregatingCallback::new(&query.name, how))
            .transpose()?;

        let resampler = query
            .downsample
            .as_ref()
            .map(|ds| ResamplingCallback::new(&query.name, &ds.name, &ds.sampling))
            .transpose()?;

        Ok(match (aggregator, resampler) {
            (Some(aggregator), Some(resampler)) => {
                Box::new(ComplexCallback::new(resampler, aggregator))
            }
            (Some(aggregator), None) => Box::new(aggregator),
            (None, Some(resampler)) => Box::new(resampler),
            (None, None) => Box::new(SimpleCallback::new(&query.name)),
        })
    }

    /// Query datapoints by time interval and tags.
    pub fn query(
        &self,
        domain: &str,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<QueryOutcome, DatastoreError> {
        let mut callback = Self::create_callback(query)?;

        query::execute_query(
            &self.schema,
            &self.readers,
            domain,
            &query.name,
            start,
            end,
            &query.tag_filter(),
            callback.as_mut(),
        )?;

        let results = callback.finish()?;

        Ok(QueryOutcome {
            sample_size: callback.sample_size(),
            results,
        })
    }

    /// Tag information only: the union of matching tagsets.
    pub fn query_metric_tags(
        &self,
        domain: &str,
        query: &MetricQuery,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<TagMultiMap, DatastoreError> {
        Ok(query::query_metric_tags(
            &self.schema,
            domain,
            &query.name,
            start,
            end,
            &query.tag_filter(),
        )?)
    }

    pub fn get_metric_names(&self, domain: &str) -> Result<Vec<String>, DatastoreError> {
        Ok(self.schema.get_metric_names(domain)?)
    }

    pub fn get_tag_names(&self, domain: &str) -> Result<Vec<String>, DatastoreError> {
        Ok(self.schema.get_tag_names(domain)?)
    }

    pub fn get_tag_values(&self, domain: &str) -> Result<Vec<String>, DatastoreError> {
        Ok(self.schema.get_tag_values(domain)?)
    }

    /// Delete-by-query hook; accepted but not implemented.
    pub fn delete_data_points(
        &self,
        _domain: &str,
        _query: &MetricQuery,
    ) -> Result<(), DatastoreError> {
        Ok(())
    }

    /// Flush cached state and stop background work.
    pub fn close(&self) {
        self.schema.close();
    }
}
