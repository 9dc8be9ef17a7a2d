//! One time-window's pair of (datapoints table, index table) and its
//! lifecycle.
//!
//! A block is writable only while it holds a batch writer; binding,
//! creation, turn-down and replacement are driven by the maintenance
//! worker. Reads and writes against an unbound block degrade to empty
//! results and dropped datapoints.

use std::sync::Arc;

use tracing::warn;

use tempo_core::{
    keys, BatchWriter, IndexKey, Item, KeySchema, KvError, KvQuery, KvStore, ScalarKey, TableDesc,
    TableSpec, TableStatus, TagSet, Throughput, Timestamp, Value,
};

use super::{SchemaContext, SchemaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Initial,
    Creating,
    Active,
    TurnedDown,
    Deleting,
    Updating,
    Undefined,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Initial => "INITIAL",
            BlockState::Creating => "CREATING",
            BlockState::Active => "ACTIVE",
            BlockState::TurnedDown => "TURNED_DOWN",
            BlockState::Deleting => "DELETING",
            BlockState::Updating => "UPDATING",
            BlockState::Undefined => "UNDEFINED",
        }
    }

    fn from_status(status: TableStatus) -> Self {
        match status {
            TableStatus::Creating => BlockState::Creating,
            TableStatus::Active => BlockState::Active,
            TableStatus::Deleting => BlockState::Deleting,
            TableStatus::Updating => BlockState::Updating,
        }
    }
}

pub struct Block<S: KvStore> {
    ctx: Arc<SchemaContext<S>>,
    master: String,
    item: Item,
    data_points_table: Option<String>,
    index_table: Option<String>,
    dp_writer: Option<BatchWriter<S::Batch>>,
}

impl<S: KvStore> Block<S> {
    /// Load the ring-slot record for position `n` and bind to its tables
    /// if they exist. Bind failures leave the block unbound.
    pub fn load(ctx: Arc<SchemaContext<S>>, master: &str, n: usize) -> Result<Self, SchemaError> {
        let query = KvQuery::hash_eq(ScalarKey::N(n as i64)).consistent(true);
        let item = ctx
            .store
            .query(master, &query)?
            .into_iter()
            .next()
            .ok_or(SchemaError::MissingSlot(n))?;

        let mut block = Self {
            ctx,
            master: master.to_string(),
            item,
            data_points_table: None,
            index_table: None,
            dp_writer: None,
        };

        if let Err(error) = block.bind() {
            warn!(n, %error, "could not bind block tables");
        }

        Ok(block)
    }

    pub fn n(&self) -> i64 {
        self.item.get_n("n").unwrap_or_default()
    }

    pub fn tbase(&self) -> Timestamp {
        self.item.get_n("tbase").unwrap_or_default()
    }

    pub fn data_points_name(&self) -> Option<&str> {
        self.item.get_s("data_points_name")
    }

    pub fn index_name(&self) -> Option<&str> {
        self.item.get_s("index_name")
    }

    fn save(&self) -> Result<(), SchemaError> {
        self.ctx
            .store
            .put_item(&self.master, self.item.clone(), true)?;
        Ok(())
    }

    /// Bind to existing tables; arms the batch writer on success.
    fn bind(&mut self) -> Result<BlockState, SchemaError> {
        let (Some(dp_name), Some(index_name)) = (
            self.data_points_name().map(str::to_string),
            self.index_name().map(str::to_string),
        ) else {
            return Ok(self.state());
        };

        let s1 = self.ctx.store.describe_table(&dp_name)?.status;
        self.dp_writer = Some(BatchWriter::new(
            self.ctx.store.batch(&dp_name)?,
            Arc::clone(&self.ctx.pool),
            self.ctx.write_delay,
        ));
        self.data_points_table = Some(dp_name);

        let s2 = self.ctx.store.describe_table(&index_name)?.status;
        self.index_table = Some(index_name);

        let state = if s1 == s2 {
            BlockState::from_status(s1)
        } else {
            BlockState::Undefined
        };
        self.item = std::mem::take(&mut self.item).with_s("state", state.as_str());

        Ok(state)
    }

    /// Create this block's tables (if missing), bind, and persist the
    /// slot record.
    pub fn create_tables(&mut self) -> Result<BlockState, SchemaError> {
        if self.data_points_table.is_some() && self.index_table.is_some() {
            return Ok(self.state());
        }

        let tbase = self.tbase();
        let blocks = self.ctx.bucketing.blocks() as u64;

        let dp_name = self.ctx.storage.table_name(&format!("dp_{tbase}"));
        let index_name = self.ctx.storage.table_name(&format!("dp_index_{tbase}"));
        self.item = std::mem::take(&mut self.item)
            .with_s("data_points_name", dp_name.clone())
            .with_s("index_name", index_name.clone());

        if self.bind().is_err() {
            if self.data_points_table.is_none() {
                self.create_missing(TableSpec {
                    name: dp_name,
                    hash: KeySchema::string("row_key"),
                    range: Some(KeySchema::number("toffset")),
                    throughput: Throughput::new(
                        self.ctx.throughput.read_datapoints / blocks,
                        self.ctx.throughput.write_datapoints,
                    ),
                })?;
            }
            if self.index_table.is_none() {
                self.create_missing(TableSpec {
                    name: index_name,
                    hash: KeySchema::string("domain_metric"),
                    range: Some(KeySchema::string("tbase_tags")),
                    throughput: Throughput::new(
                        self.ctx.throughput.read_index_key / blocks,
                        self.ctx.throughput.write_index_key,
                    ),
                })?;
            }

            self.bind()?;
        }

        self.save()?;
        Ok(self.state())
    }

    fn create_missing(&self, spec: TableSpec) -> Result<(), SchemaError> {
        match self.ctx.store.create_table(spec) {
            // a concurrent creator got there first; bind will pick it up
            Ok(()) | Err(KvError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rotate this slot to a new window. Deletes the outgoing tables;
    /// writes that race the rotation are dropped by contract.
    pub fn replace(&mut self, t: Timestamp) -> Result<(), SchemaError> {
        let pos = self.ctx.bucketing.block_pos(t);
        if pos as i64 != self.n() {
            return Err(SchemaError::WrongSlot {
                time: t,
                pos,
                slot: self.n() as usize,
            });
        }

        if self.ctx.bucketing.base_time(t) == self.tbase() {
            return Ok(());
        }

        self.delete_tables(Some(t))
    }

    /// Drop the writer, delete both tables, and reset the slot record to
    /// INITIAL at the new base time.
    pub fn delete_tables(&mut self, new_time: Option<Timestamp>) -> Result<(), SchemaError> {
        let new_time = new_time.unwrap_or_else(|| self.tbase());

        if let Some(writer) = self.dp_writer.take() {
            if let Err(error) = writer.flush() {
                warn!(%error, "flush failed while deleting block tables");
            }
        }

        for table in [self.data_points_table.take(), self.index_table.take()]
            .into_iter()
            .flatten()
        {
            if let Err(error) = self.ctx.store.delete_table(&table) {
                warn!(table, %error, "could not delete block table");
            }
        }

        let old_tbase = self.tbase();
        if let Err(error) = self.ctx.store.delete_item(
            &self.master,
            ScalarKey::N(self.n()),
            Some(ScalarKey::N(old_tbase)),
        ) {
            warn!(%error, "could not delete ring slot record");
        }

        self.item = Item::new()
            .with_n("n", self.n())
            .with_n("tbase", self.ctx.bucketing.base_time(new_time))
            .with_s("state", BlockState::Initial.as_str());
        self.save()?;

        Ok(())
    }

    /// Reduce write throughput; terminal for writes on this block.
    pub fn turndown_tables(&mut self) {
        let blocks = self.ctx.bucketing.blocks() as u64;

        if let Some(writer) = self.dp_writer.take() {
            if let Err(error) = writer.flush() {
                warn!(%error, "flush failed during block turn-down");
            }
        }

        if let Some(table) = &self.data_points_table {
            let throughput = Throughput::new(self.ctx.throughput.read_datapoints / blocks, 1);
            if let Err(error) = self.ctx.store.update_throughput(table, throughput) {
                warn!(table, %error, "could not turn down datapoints table");
            }
        }

        if let Some(table) = &self.index_table {
            let throughput = Throughput::new(self.ctx.throughput.read_index_key / blocks, 1);
            if let Err(error) = self.ctx.store.update_throughput(table, throughput) {
                warn!(table, %error, "could not turn down index table");
            }
        }
    }

    fn calc_state(desc: TableDesc) -> BlockState {
        if desc.status == TableStatus::Active && desc.throughput.write == 1 {
            return BlockState::TurnedDown;
        }
        BlockState::from_status(desc.status)
    }

    /// Recompute the block state from the pair of table statuses.
    pub fn state(&self) -> BlockState {
        if self.item.get_s("state") == Some(BlockState::Initial.as_str()) {
            return BlockState::Initial;
        }

        let (Some(dp), Some(index)) = (&self.data_points_table, &self.index_table) else {
            return BlockState::Undefined;
        };

        let s1 = match self.ctx.store.describe_table(dp) {
            Ok(desc) => Self::calc_state(desc),
            Err(_) => return BlockState::Undefined,
        };
        let s2 = match self.ctx.store.describe_table(index) {
            Ok(desc) => Self::calc_state(desc),
            Err(_) => return BlockState::Undefined,
        };

        if s1 != s2 {
            return BlockState::Undefined;
        }
        s1
    }

    pub fn has_writer(&self) -> bool {
        self.dp_writer.is_some()
    }

    /// Drain any batched writes immediately.
    pub fn flush_writes(&self) {
        if let Some(writer) = &self.dp_writer {
            if let Err(error) = writer.flush() {
                warn!(%error, "explicit block flush failed");
            }
        }
    }

    /// Store one datapoint and its index row. A block without a writer
    /// drops the point; write failures are reported and dropped.
    pub fn store_datapoint(
        &self,
        t: Timestamp,
        metric: &str,
        tags: &TagSet,
        value: Value,
        domain: &str,
    ) {
        let Some(writer) = &self.dp_writer else {
            return;
        };

        let key = keys::datapoint_row_key(&self.ctx.bucketing, domain, metric, t, tags);

        if !self.store_index(&key, t, metric, tags, domain) {
            return;
        }

        writer.put(
            Item::new()
                .with_s("row_key", key)
                .with_n("toffset", self.ctx.bucketing.offset_time(t))
                .with_value("value", value),
        );
    }

    /// Ensure the index row for a datapoint key exists. Deduplicated via
    /// the process-wide write-index LRU.
    fn store_index(
        &self,
        key: &str,
        t: Timestamp,
        metric: &str,
        tags: &TagSet,
        domain: &str,
    ) -> bool {
        let Some(index_table) = &self.index_table else {
            return false;
        };

        if self.ctx.write_index_cache.contains(&key.to_string()) {
            return true;
        }

        let item = Item::new()
            .with_s("domain_metric", keys::index_hash_key(domain, metric))
            .with_s("tbase_tags", keys::index_range_key(&self.ctx.bucketing, t, tags));

        match self.ctx.store.put_item(index_table, item, true) {
            Ok(()) => {
                self.ctx.write_index_cache.add(key.to_string());
                true
            }
            Err(error) => {
                warn!(%error, "dropping datapoint, index row write failed");
                false
            }
        }
    }

    /// All index keys for `(domain, metric)` overlapping `[start, end]`.
    /// Backend failures degrade to an empty result.
    pub fn query_index(
        &self,
        domain: &str,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<IndexKey> {
        let Some(index_table) = &self.index_table else {
            return Vec::new();
        };

        let hash = keys::index_hash_key(domain, metric);
        let low = self.ctx.bucketing.base_time(start).to_string();
        let high = (self.ctx.bucketing.base_time(end) + 1).to_string();
        let query = KvQuery::hash_eq(hash).between(low, high);

        let items = match self.ctx.store.query(index_table, &query) {
            Ok(items) => items,
            Err(error) => {
                warn!(%error, "index query failed, returning empty");
                return Vec::new();
            }
        };

        items
            .into_iter()
            .filter_map(|item| {
                match (item.get_s("domain_metric"), item.get_s("tbase_tags")) {
                    (Some(hash), Some(range)) => Some(IndexKey::new(hash, range)),
                    _ => {
                        warn!("skipping index row with missing key attributes");
                        None
                    }
                }
            })
            .collect()
    }

    /// Raw datapoint rows for one index key, newest first. Backend
    /// failures degrade to an empty result.
    pub fn query_datapoints(
        &self,
        key: &IndexKey,
        start: Timestamp,
        end: Timestamp,
        attributes: &[&str],
    ) -> Result<Vec<Item>, SchemaError> {
        let Some(dp_table) = &self.data_points_table else {
            return Ok(Vec::new());
        };

        let row_key = key.to_datapoint_row_key()?;
        let (low, high) = keys::offset_range(&self.ctx.bucketing, key, start, end)?;

        let mut projection = vec!["toffset".to_string()];
        projection.extend(attributes.iter().map(|a| a.to_string()));

        let query = KvQuery::hash_eq(row_key)
            .between(low, high)
            .attributes(projection)
            .reverse(true);

        match self.ctx.store.query(dp_table, &query) {
            Ok(items) => Ok(items),
            Err(error) => {
                warn!(%error, "datapoint query failed, returning empty");
                Ok(Vec::new())
            }
        }
    }
}
