//! The schema facade: block ring, ancillary catalogs, credentials, and
//! the query-side result caches, behind one entry point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use tempo_core::{
    Bucketing, Clock, ConfigError, IndexKey, KeyError, KeySchema, KvError, KvStore, LruMap,
    LruSet, ScheduledPool, StorageConfig, TableSpec, TableStatus, TagSet, Throughput,
    ThroughputConfig, Timestamp, Value,
};

use crate::model::Credential;

pub mod block;
pub mod catalog;
pub mod ring;

pub use block::{Block, BlockState};
pub use ring::{BlockRing, MaintenanceWorker};

use catalog::Catalog;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("store error: {0}")]
    Store(#[from] KvError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("ring slot {0} has no master record")]
    MissingSlot(usize),

    #[error("time {time} (pos {pos}) is not valid for block slot {slot}")]
    WrongSlot {
        time: Timestamp,
        pos: usize,
        slot: usize,
    },

    #[error("table {0} did not become active in time")]
    TableNeverActive(String),
}

/// Shared state every block and catalog needs: the store handle, the
/// retention geometry, throughput targets, the write pool, and the
/// write-side index dedup cache.
pub struct SchemaContext<S: KvStore> {
    pub store: S,
    pub bucketing: Bucketing,
    pub storage: StorageConfig,
    pub throughput: ThroughputConfig,
    pub pool: Arc<ScheduledPool>,
    pub write_delay: Duration,
    pub write_index_cache: LruSet<String>,
    pub clock: Clock,
}

/// Poll a table description until it reports ACTIVE.
pub fn wait_for_active<S: KvStore>(store: &S, name: &str) -> Result<(), SchemaError> {
    const MAX_WAIT: u32 = 120;
    const RETRY: Duration = Duration::from_secs(1);

    for attempt in 0..MAX_WAIT {
        if store.describe_table(name)?.status == TableStatus::Active {
            return Ok(());
        }
        if attempt + 1 < MAX_WAIT {
            std::thread::sleep(RETRY);
        }
    }

    Err(SchemaError::TableNeverActive(name.to_string()))
}

pub struct Schema<S: KvStore> {
    ctx: Arc<SchemaContext<S>>,
    ring: Arc<BlockRing<S>>,
    metric_names: Catalog<S>,
    tag_names: Catalog<S>,
    tag_values: Catalog<S>,
    credentials_table: String,
    index_query_cache: LruMap<String, Vec<IndexKey>>,
    datapoint_cache: LruMap<String, Vec<(Timestamp, Value)>>,
    worker: Mutex<Option<MaintenanceWorker>>,
}

impl<S: KvStore> Schema<S> {
    fn build_context(store: S, config: &crate::Config, clock: Clock) -> Result<SchemaContext<S>, SchemaError> {
        Ok(SchemaContext {
            store,
            bucketing: config.retention.bucketing()?,
            storage: config.storage.clone(),
            throughput: config.throughput,
            pool: Arc::new(ScheduledPool::new(config.write.writers)),
            write_delay: Duration::from_secs(config.write.write_delay),
            write_index_cache: LruSet::new(config.cache.write_index_key),
            clock,
        })
    }

    /// Create every schema table: catalogs, credentials, and the seeded
    /// ring master.
    pub fn create(store: S, config: &crate::Config, clock: Clock) -> Result<(), SchemaError> {
        let ctx = Self::build_context(store, config, clock)?;

        for (suffix, attribute) in [
            ("metric_names", "name"),
            ("tag_names", "name"),
            ("tag_values", "value"),
        ] {
            let table = ctx.storage.table_name(suffix);
            ctx.store
                .create_table(Catalog::<S>::spec(table, attribute))?;
        }

        ctx.store.create_table(TableSpec {
            name: ctx.storage.table_name("credentials"),
            hash: KeySchema::string("access_key_id"),
            range: None,
            throughput: Throughput::new(1, 1),
        })?;

        BlockRing::create(&ctx)?;

        info!(table_space = %ctx.storage.table_space, "schema created");
        Ok(())
    }

    /// Bind to an existing schema.
    pub fn open(store: S, config: &crate::Config, clock: Clock) -> Result<Self, SchemaError> {
        let ctx = Arc::new(Self::build_context(store, config, clock)?);

        let dedup = config.cache.write_index_key;
        let metric_names = Catalog::new(
            ctx.store.clone(),
            ctx.storage.table_name("metric_names"),
            "name",
            dedup,
        );
        let tag_names = Catalog::new(
            ctx.store.clone(),
            ctx.storage.table_name("tag_names"),
            "name",
            dedup,
        );
        let tag_values = Catalog::new(
            ctx.store.clone(),
            ctx.storage.table_name("tag_values"),
            "value",
            dedup,
        );

        let ring = Arc::new(BlockRing::open(Arc::clone(&ctx), config.maintenance)?);

        Ok(Self {
            credentials_table: ctx.storage.table_name("credentials"),
            metric_names,
            tag_names,
            tag_values,
            index_query_cache: LruMap::new(config.cache.query_index_key),
            datapoint_cache: LruMap::new(config.cache.datapoints),
            worker: Mutex::new(None),
            ring,
            ctx,
        })
    }

    pub fn ring(&self) -> &Arc<BlockRing<S>> {
        &self.ring
    }

    pub fn bucketing(&self) -> &Bucketing {
        &self.ctx.bucketing
    }

    pub fn now(&self) -> Timestamp {
        self.ctx.clock.now()
    }

    pub fn start_maintenance(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            *worker = Some(MaintenanceWorker::start(Arc::clone(&self.ring)));
        }
    }

    pub fn stop_maintenance(&self) {
        if let Some(mut worker) = self.worker.lock().unwrap().take() {
            worker.shutdown();
        }
    }

    /// Store one datapoint: catalogs first (dedup'd), then the block
    /// covering its timestamp. Points outside every block are dropped.
    pub fn store_datapoint(
        &self,
        t: Timestamp,
        metric: &str,
        tags: &TagSet,
        value: Value,
        domain: &str,
    ) {
        if let Err(error) = self.metric_names.store(domain, metric) {
            warn!(%error, "metric name catalog write failed");
        }
        for (name, tag_value) in tags {
            if let Err(error) = self.tag_names.store(domain, name) {
                warn!(%error, "tag name catalog write failed");
            }
            if let Err(error) = self.tag_values.store(domain, tag_value) {
                warn!(%error, "tag value catalog write failed");
            }
        }

        if let Some(block) = self.ring.get(t) {
            block.store_datapoint(t, metric, tags, value, domain);
        }
    }

    /// All index keys for `(domain, metric)` in `[start, end]`, clamped
    /// to available history and walked newest block first.
    pub fn query_index(
        &self,
        domain: &str,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<IndexKey>, SchemaError> {
        let bucketing = &self.ctx.bucketing;
        let now = self.ctx.clock.now();

        let max_time = now;
        let min_time = now - bucketing.available_history();

        let start = min_time.max(start).min(max_time);
        let end = max_time.min(end).max(min_time);
        if start == end {
            return Ok(Vec::new());
        }

        // results are only cached when the whole range lies in closed
        // blocks; the current block is still being written
        let cacheable = bucketing.base_time(end) < bucketing.base_time(now);
        let cache_key = format!(
            "{domain}|{metric}|{}|{}",
            bucketing.base_time(start),
            bucketing.base_time(end)
        );

        if cacheable {
            if let Some(hit) = self.index_query_cache.get(&cache_key) {
                return Ok(hit);
            }
        }

        let mut keys = Vec::new();
        let mut t = bucketing.base_time(end);
        while t >= bucketing.base_time(start) {
            if let Some(block) = self.ring.get(t) {
                keys.extend(block.query_index(domain, metric, start, end));
            }
            t -= bucketing.block_size();
        }

        if cacheable {
            self.index_query_cache.put(cache_key, keys.clone());
        }

        Ok(keys)
    }

    /// Datapoints for one index key as absolute-time pairs, newest
    /// first.
    pub fn query_datapoints(
        &self,
        key: &IndexKey,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, Value)>, SchemaError> {
        let bucketing = &self.ctx.bucketing;
        let tbase = key.tbase()?;

        let Some(block) = self.ring.get(tbase) else {
            return Ok(Vec::new());
        };

        let cacheable = tbase < bucketing.base_time(self.ctx.clock.now());
        let (low, high) = tempo_core::keys::offset_range(bucketing, key, start, end)?;
        let cache_key = format!("{}|{low}|{high}", key.to_datapoint_row_key()?);

        if cacheable {
            if let Some(hit) = self.datapoint_cache.get(&cache_key) {
                return Ok(hit);
            }
        }

        let items = block.query_datapoints(key, start, end, &["value"])?;
        drop(block);

        let points: Vec<(Timestamp, Value)> = items
            .into_iter()
            .filter_map(|item| {
                match (item.get_n("toffset"), item.get_value("value")) {
                    (Some(toffset), Some(value)) => Some((tbase + toffset, value.clone())),
                    _ => {
                        warn!("skipping datapoint row with missing attributes");
                        None
                    }
                }
            })
            .collect();

        if cacheable {
            self.datapoint_cache.put(cache_key, points.clone());
        }

        Ok(points)
    }

    pub fn get_metric_names(&self, domain: &str) -> Result<Vec<String>, SchemaError> {
        self.metric_names.list(domain)
    }

    pub fn get_tag_names(&self, domain: &str) -> Result<Vec<String>, SchemaError> {
        self.tag_names.list(domain)
    }

    pub fn get_tag_values(&self, domain: &str) -> Result<Vec<String>, SchemaError> {
        self.tag_values.list(domain)
    }

    /// Load the whole credentials catalog, keyed by access key id.
    pub fn get_credentials(&self) -> Result<HashMap<String, Credential>, SchemaError> {
        let items = self.ctx.store.scan(&self.credentials_table)?;

        let credentials = items
            .into_iter()
            .filter_map(|item| {
                let access_key_id = item.get_s("access_key_id")?.to_string();
                let secret_access_key = item.get_s("secret_access_key")?.to_string();
                let state = item.get_s("state")?.to_string();

                let permissions = match item.get_value("permissions") {
                    Some(Value::Blob(json)) => {
                        serde_json::from_value(json.clone()).unwrap_or_default()
                    }
                    _ => Vec::new(),
                };

                Some((
                    access_key_id.clone(),
                    Credential {
                        access_key_id,
                        secret_access_key,
                        state,
                        permissions,
                    },
                ))
            })
            .collect();

        Ok(credentials)
    }

    /// Insert or replace a credential record.
    pub fn put_credential(&self, credential: &Credential) -> Result<(), SchemaError> {
        let permissions = serde_json::to_value(&credential.permissions)
            .unwrap_or(serde_json::Value::Array(Vec::new()));

        let item = tempo_core::Item::new()
            .with_s("access_key_id", credential.access_key_id.clone())
            .with_s("secret_access_key", credential.secret_access_key.clone())
            .with_s("state", credential.state.clone())
            .with_value("permissions", Value::Blob(permissions));

        self.ctx.store.put_item(&self.credentials_table, item, true)?;
        Ok(())
    }

    /// Flush pending writes and stop background work.
    pub fn close(&self) {
        self.stop_maintenance();
        self.ring.flush_all();
    }
}
