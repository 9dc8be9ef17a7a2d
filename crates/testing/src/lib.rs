//! Test support: an in-memory [`KvStore`] with the same contract as the
//! durable backends, plus small fixture helpers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tempo_core::{
    Item, KvBatch, KvError, KvQuery, KvStore, ScalarKey, TableDesc, TableSpec, TableStatus,
    TagFilter, TagSet, Throughput,
};

#[cfg(test)]
use tempo_core::KeySchema;

pub mod fixtures;

/// Rows for one hash key, ordered by range key. Hash-only tables keep a
/// single row under `None`.
type HashRows = BTreeMap<Option<ScalarKey>, Item>;

struct MemTable {
    spec: TableSpec,
    status: TableStatus,
    rows: BTreeMap<ScalarKey, HashRows>,
}

/// In-memory hash+range store. Tables become ACTIVE immediately on
/// creation; the consistency flag is a no-op.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, MemTable>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn insert(&self, table: &str, item: Item, overwrite: bool) -> Result<(), KvError> {
        let mut tables = self.tables.write().unwrap();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| KvError::TableNotFound(table.to_string()))?;

        let (hash, range) = entry.spec.item_key(&item)?;

        let rows = entry.rows.entry(hash).or_default();
        if !overwrite && rows.contains_key(&range) {
            return Err(KvError::Conflict(table.to_string()));
        }
        rows.insert(range, item);

        Ok(())
    }
}

pub struct MemoryBatch {
    store: MemoryStore,
    table: String,
    pending: Vec<Item>,
}

impl KvBatch for MemoryBatch {
    fn put(&mut self, item: Item) -> Result<(), KvError> {
        self.pending.push(item);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), KvError> {
        for item in self.pending.drain(..) {
            self.store.insert(&self.table, item, true)?;
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    type Batch = MemoryBatch;

    fn create_table(&self, spec: TableSpec) -> Result<(), KvError> {
        let mut tables = self.tables.write().unwrap();

        if tables.contains_key(&spec.name) {
            return Err(KvError::Conflict(spec.name));
        }

        tables.insert(
            spec.name.clone(),
            MemTable {
                spec,
                status: TableStatus::Active,
                rows: BTreeMap::new(),
            },
        );

        Ok(())
    }

    fn describe_table(&self, name: &str) -> Result<TableDesc, KvError> {
        let tables = self.tables.read().unwrap();
        let table = tables
            .get(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        Ok(TableDesc {
            status: table.status,
            throughput: table.spec.throughput,
        })
    }

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<(), KvError> {
        let mut tables = self.tables.write().unwrap();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        table.spec.throughput = throughput;
        Ok(())
    }

    fn delete_table(&self, name: &str) -> Result<(), KvError> {
        let mut tables = self.tables.write().unwrap();
        tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))
    }

    fn put_item(&self, name: &str, item: Item, overwrite: bool) -> Result<(), KvError> {
        self.insert(name, item, overwrite)
    }

    fn delete_item(
        &self,
        name: &str,
        hash: ScalarKey,
        range: Option<ScalarKey>,
    ) -> Result<(), KvError> {
        let mut tables = self.tables.write().unwrap();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        if let Some(rows) = table.rows.get_mut(&hash) {
            rows.remove(&range);
            if rows.is_empty() {
                table.rows.remove(&hash);
            }
        }

        Ok(())
    }

    fn batch(&self, name: &str) -> Result<Self::Batch, KvError> {
        let tables = self.tables.read().unwrap();
        if !tables.contains_key(name) {
            return Err(KvError::TableNotFound(name.to_string()));
        }

        Ok(MemoryBatch {
            store: self.clone(),
            table: name.to_string(),
            pending: Vec::new(),
        })
    }

    fn query(&self, name: &str, query: &KvQuery) -> Result<Vec<Item>, KvError> {
        let tables = self.tables.read().unwrap();
        let table = tables
            .get(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        let Some(rows) = table.rows.get(&query.hash) else {
            return Ok(Vec::new());
        };

        let select = |item: &Item| match &query.attributes {
            Some(attributes) => item.clone().project(attributes),
            None => item.clone(),
        };

        let mut matches: Vec<Item> = match &query.range {
            Some((low, high)) if low > high => Vec::new(),
            Some((low, high)) => rows
                .range(Some(low.clone())..=Some(high.clone()))
                .map(|(_, item)| select(item))
                .collect(),
            None => rows.values().map(select).collect(),
        };

        if query.reverse {
            matches.reverse();
        }

        Ok(matches)
    }

    fn scan(&self, name: &str) -> Result<Vec<Item>, KvError> {
        let tables = self.tables.read().unwrap();
        let table = tables
            .get(name)
            .ok_or_else(|| KvError::TableNotFound(name.to_string()))?;

        Ok(table
            .rows
            .values()
            .flat_map(|rows| rows.values().cloned())
            .collect())
    }
}

/// Build a tagset from literal pairs.
pub fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Build a tag filter from literal pairs of name and permitted values.
pub fn tag_filter(pairs: &[(&str, &[&str])]) -> TagFilter {
    pairs
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::Value;

    fn spec(name: &str) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            hash: KeySchema::string("pk"),
            range: Some(KeySchema::number("sk")),
            throughput: Throughput::new(5, 5),
        }
    }

    #[test]
    fn create_then_describe() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();

        let desc = store.describe_table("t").unwrap();
        assert_eq!(desc.status, TableStatus::Active);
        assert_eq!(desc.throughput, Throughput::new(5, 5));

        assert!(matches!(
            store.describe_table("missing"),
            Err(KvError::TableNotFound(_))
        ));
    }

    #[test]
    fn duplicate_create_conflicts() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();
        assert!(matches!(
            store.create_table(spec("t")),
            Err(KvError::Conflict(_))
        ));
    }

    #[test]
    fn range_query_honors_bounds_and_reverse() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();

        for n in 0..5 {
            let item = Item::new()
                .with_s("pk", "a")
                .with_n("sk", n)
                .with_value("value", Value::Int(n));
            store.put_item("t", item, true).unwrap();
        }

        let query = KvQuery::hash_eq("a").between(1i64, 3i64).reverse(true);
        let items = store.query("t", &query).unwrap();

        let keys: Vec<_> = items.iter().map(|i| i.get_n("sk").unwrap()).collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }

    #[test]
    fn overwrite_false_conflicts_on_existing_key() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();

        let item = Item::new().with_s("pk", "a").with_n("sk", 1);
        store.put_item("t", item.clone(), false).unwrap();
        assert!(matches!(
            store.put_item("t", item, false),
            Err(KvError::Conflict(_))
        ));
    }

    #[test]
    fn batch_is_invisible_until_flush() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();

        let mut batch = store.batch("t").unwrap();
        for n in 0..3 {
            batch
                .put(Item::new().with_s("pk", "a").with_n("sk", n))
                .unwrap();
        }

        assert!(store.query("t", &KvQuery::hash_eq("a")).unwrap().is_empty());
        batch.flush().unwrap();
        assert_eq!(store.query("t", &KvQuery::hash_eq("a")).unwrap().len(), 3);
    }

    #[test]
    fn projection_limits_attributes() {
        let store = MemoryStore::new();
        store.create_table(spec("t")).unwrap();

        let item = Item::new()
            .with_s("pk", "a")
            .with_n("sk", 1)
            .with_value("value", Value::Int(9))
            .with_s("extra", "x");
        store.put_item("t", item, true).unwrap();

        let query =
            KvQuery::hash_eq("a").attributes(vec!["sk".to_string(), "value".to_string()]);
        let items = store.query("t", &query).unwrap();

        assert_eq!(items[0].get_n("sk"), Some(1));
        assert!(items[0].get("pk").is_none());
        assert!(items[0].get("extra").is_none());
    }
}
