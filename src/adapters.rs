use tempo_core::{
    Item, KvBatch, KvError, KvQuery, KvStore, ScalarKey, StorageConfig, TableDesc, TableSpec,
    Throughput,
};
use tempo_redb::{RedbBatch, RedbStore};

/// A persistent hash+range store for the schema.
#[derive(Clone)]
#[non_exhaustive]
pub enum StoreAdapter {
    Redb(RedbStore),
}

impl StoreAdapter {
    /// Open storage per configuration: a durable redb file when a path
    /// is set, an ephemeral in-memory backend otherwise.
    pub fn open(config: &StorageConfig) -> Result<Self, KvError> {
        let store = match &config.path {
            Some(path) => {
                std::fs::create_dir_all(path).map_err(KvError::transport)?;
                RedbStore::open(path.join("store.redb"), config.cache_mb)?
            }
            None => RedbStore::memory()?,
        };

        Ok(StoreAdapter::Redb(store))
    }
}

impl From<RedbStore> for StoreAdapter {
    fn from(value: RedbStore) -> Self {
        Self::Redb(value)
    }
}

pub enum StoreBatch {
    Redb(RedbBatch),
}

impl KvBatch for StoreBatch {
    fn put(&mut self, item: Item) -> Result<(), KvError> {
        match self {
            StoreBatch::Redb(x) => x.put(item),
        }
    }

    fn flush(&mut self) -> Result<(), KvError> {
        match self {
            StoreBatch::Redb(x) => x.flush(),
        }
    }
}

impl KvStore for StoreAdapter {
    type Batch = StoreBatch;

    fn create_table(&self, spec: TableSpec) -> Result<(), KvError> {
        match self {
            StoreAdapter::Redb(x) => x.create_table(spec),
        }
    }

    fn describe_table(&self, name: &str) -> Result<TableDesc, KvError> {
        match self {
            StoreAdapter::Redb(x) => x.describe_table(name),
        }
    }

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<(), KvError> {
        match self {
            StoreAdapter::Redb(x) => x.update_throughput(name, throughput),
        }
    }

    fn delete_table(&self, name: &str) -> Result<(), KvError> {
        match self {
            StoreAdapter::Redb(x) => x.delete_table(name),
        }
    }

    fn put_item(&self, name: &str, item: Item, overwrite: bool) -> Result<(), KvError> {
        match self {
            StoreAdapter::Redb(x) => x.put_item(name, item, overwrite),
        }
    }

    fn delete_item(
        &self,
        name: &str,
        hash: ScalarKey,
        range: Option<ScalarKey>,
    ) -> Result<(), KvError> {
        match self {
            StoreAdapter::Redb(x) => x.delete_item(name, hash, range),
        }
    }

    fn batch(&self, name: &str) -> Result<Self::Batch, KvError> {
        let out = match self {
            StoreAdapter::Redb(x) => StoreBatch::Redb(x.batch(name)?),
        };

        Ok(out)
    }

    fn query(&self, name: &str, query: &KvQuery) -> Result<Vec<Item>, KvError> {
        match self {
            StoreAdapter::Redb(x) => x.query(name, query),
        }
    }

    fn scan(&self, name: &str) -> Result<Vec<Item>, KvError> {
        match self {
            StoreAdapter::Redb(x) => x.scan(name),
        }
    }
}
