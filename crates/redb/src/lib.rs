//! Durable [`KvStore`] implementation backed by redb.
//!
//! One redb database holds everything: a `tables` catalog mapping table
//! names to their schema, status, and provisioned throughput, plus one
//! redb table per logical KV table. Rows are composite-key encoded (see
//! [`keys`]); table metadata is bincode, item payloads are JSON because
//! the opaque value attribute has no fixed shape.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tempo_core::{
    Item, KvBatch, KvError, KvQuery, KvStore, ScalarKey, TableDesc, TableSpec, TableStatus,
    Throughput,
};

pub mod keys;

use keys::{composite_key, hash_prefix, prefix_successor};

const TABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("tables");

const DEFAULT_CACHE_SIZE_MB: usize = 50;

#[derive(Serialize, Deserialize)]
struct TableMeta {
    spec: TableSpec,
    status: TableStatus,
}

fn data_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<redb::Database>,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>, cache_mb: Option<usize>) -> Result<Self, KvError> {
        let db = redb::Database::builder()
            .set_repair_callback(|x| {
                warn!(progress = x.progress() * 100f64, "store db is repairing")
            })
            .set_cache_size(1024 * 1024 * cache_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB))
            .create(path)
            .map_err(KvError::transport)?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn memory() -> Result<Self, KvError> {
        let db = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(KvError::transport)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn load_meta(&self, name: &str) -> Result<TableMeta, KvError> {
        let rx = self.db.begin_read().map_err(KvError::transport)?;

        let table = match rx.open_table(TABLES) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Err(KvError::TableNotFound(name.to_string()))
            }
            Err(e) => return Err(KvError::transport(e)),
        };

        let raw = table
            .get(name)
            .map_err(KvError::transport)?
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        bincode::deserialize(raw.value()).map_err(KvError::transport)
    }

    fn store_meta(
        wx: &redb::WriteTransaction,
        name: &str,
        meta: &TableMeta,
    ) -> Result<(), KvError> {
        let mut table = wx.open_table(TABLES).map_err(KvError::transport)?;
        let encoded = bincode::serialize(meta).map_err(KvError::transport)?;
        table.insert(name, encoded.as_slice()).map_err(KvError::transport)?;
        Ok(())
    }

    fn write_items(
        &self,
        name: &str,
        items: &[Item],
        overwrite: bool,
    ) -> Result<(), KvError> {
        let meta = self.load_meta(name)?;

        let wx = self.db.begin_write().map_err(KvError::transport)?;
        {
            let mut table = wx.open_table(data_table(name)).map_err(KvError::transport)?;

            for item in items {
                let (hash, range) = meta.spec.item_key(item)?;
                let key = composite_key(&hash, range.as_ref());

                if !overwrite {
                    let existing = table.get(key.as_slice()).map_err(KvError::transport)?;
                    if existing.is_some() {
                        return Err(KvError::Conflict(name.to_string()));
                    }
                }

                let encoded = serde_json::to_vec(item).map_err(KvError::transport)?;
                table
                    .insert(key.as_slice(), encoded.as_slice())
                    .map_err(KvError::transport)?;
            }
        }
        wx.commit().map_err(KvError::transport)?;

        Ok(())
    }
}

pub struct RedbBatch {
    store: RedbStore,
    table: String,
    pending: Vec<Item>,
}

impl KvBatch for RedbBatch {
    fn put(&mut self, item: Item) -> Result<(), KvError> {
        self.pending.push(item);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), KvError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let items = std::mem::take(&mut self.pending);
        self.store.write_items(&self.table, &items, true)
    }
}

impl KvStore for RedbStore {
    type Batch = RedbBatch;

    fn create_table(&self, spec: TableSpec) -> Result<(), KvError> {
        let wx = self.db.begin_write().map_err(KvError::transport)?;
        {
            let mut tables = wx.open_table(TABLES).map_err(KvError::transport)?;

            let existing = tables.get(spec.name.as_str()).map_err(KvError::transport)?;
            if existing.is_some() {
                return Err(KvError::Conflict(spec.name));
            }
            drop(existing);

            let meta = TableMeta {
                status: TableStatus::Active,
                spec,
            };
            let encoded = bincode::serialize(&meta).map_err(KvError::transport)?;
            tables
                .insert(meta.spec.name.as_str(), encoded.as_slice())
                .map_err(KvError::transport)?;

            // materialize the data table so later reads find it
            let _ = wx
                .open_table(data_table(&meta.spec.name))
                .map_err(KvError::transport)?;
        }
        wx.commit().map_err(KvError::transport)?;

        Ok(())
    }

    fn describe_table(&self, name: &str) -> Result<TableDesc, KvError> {
        let meta = self.load_meta(name)?;

        Ok(TableDesc {
            status: meta.status,
            throughput: meta.spec.throughput,
        })
    }

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<(), KvError> {
        let mut meta = self.load_meta(name)?;
        meta.spec.throughput = throughput;

        let wx = self.db.begin_write().map_err(KvError::transport)?;
        Self::store_meta(&wx, name, &meta)?;
        wx.commit().map_err(KvError::transport)?;

        Ok(())
    }

    fn delete_table(&self, name: &str) -> Result<(), KvError> {
        // fails with TableNotFound before touching anything
        let _ = self.load_meta(name)?;

        let wx = self.db.begin_write().map_err(KvError::transport)?;
        {
            let mut tables = wx.open_table(TABLES).map_err(KvError::transport)?;
            tables.remove(name).map_err(KvError::transport)?;
        }
        wx.delete_table(data_table(name)).map_err(KvError::transport)?;
        wx.commit().map_err(KvError::transport)?;

        Ok(())
    }

    fn put_item(&self, name: &str, item: Item, overwrite: bool) -> Result<(), KvError> {
        self.write_items(name, std::slice::from_ref(&item), overwrite)
    }

    fn delete_item(
        &self,
        name: &str,
        hash: ScalarKey,
        range: Option<ScalarKey>,
    ) -> Result<(), KvError> {
        let _ = self.load_meta(name)?;

        let key = composite_key(&hash, range.as_ref());

        let wx = self.db.begin_write().map_err(KvError::transport)?;
        {
            let mut table = wx.open_table(data_table(name)).map_err(KvError::transport)?;
            table.remove(key.as_slice()).map_err(KvError::transport)?;
        }
        wx.commit().map_err(KvError::transport)?;

        Ok(())
    }

    fn batch(&self, name: &str) -> Result<Self::Batch, KvError> {
        let _ = self.load_meta(name)?;

        Ok(RedbBatch {
            store: self.clone(),
            table: name.to_string(),
            pending: Vec::new(),
        })
    }

    fn query(&self, name: &str, query: &KvQuery) -> Result<Vec<Item>, KvError> {
        let _ = self.load_meta(name)?;

        let rx = self.db.begin_read().map_err(KvError::transport)?;
        let table = rx.open_table(data_table(name)).map_err(KvError::transport)?;

        if let Some((low, high)) = &query.range {
            if low > high {
                return Ok(Vec::new());
            }
        }

        let prefix = hash_prefix(&query.hash);

        let (low, high): (Vec<u8>, Option<Vec<u8>>) = match &query.range {
            Some((a, b)) => (
                composite_key(&query.hash, Some(a)),
                // the range upper bound is inclusive; extend by a zero
                // byte to keep equal keys inside the half-open scan
                Some({
                    let mut high = composite_key(&query.hash, Some(b));
                    high.push(0);
                    high
                }),
            ),
            None => (prefix.clone(), prefix_successor(prefix.clone())),
        };

        let bounds = (
            Bound::Included(low.as_slice()),
            match &high {
                Some(high) => Bound::Excluded(high.as_slice()),
                None => Bound::Unbounded,
            },
        );

        let rows = table.range::<&[u8]>(bounds).map_err(KvError::transport)?;

        let mut decode = |entry: Result<
            (redb::AccessGuard<'_, &[u8]>, redb::AccessGuard<'_, &[u8]>),
            redb::StorageError,
        >|
         -> Result<Item, KvError> {
            let (_, value) = entry.map_err(KvError::transport)?;
            let item: Item =
                serde_json::from_slice(value.value()).map_err(KvError::transport)?;
            Ok(match &query.attributes {
                Some(attributes) => item.project(attributes),
                None => item,
            })
        };

        if query.reverse {
            rows.rev().map(&mut decode).collect()
        } else {
            rows.map(&mut decode).collect()
        }
    }

    fn scan(&self, name: &str) -> Result<Vec<Item>, KvError> {
        let _ = self.load_meta(name)?;

        let rx = self.db.begin_read().map_err(KvError::transport)?;
        let table = rx.open_table(data_table(name)).map_err(KvError::transport)?;

        table
            .range::<&[u8]>(..)
            .map_err(KvError::transport)?
            .map(|entry| {
                let (_, value) = entry.map_err(KvError::transport)?;
                serde_json::from_slice(value.value()).map_err(KvError::transport)
            })
            .collect()
    }
}
