//! Ancillary catalogs: per-domain metric names, tag names, and tag
//! values, with write-side dedup so only first sightings hit the store.

use tempo_core::{
    Item, KeySchema, KvQuery, KvStore, LruSet, TableSpec, Throughput,
};

use super::SchemaError;

pub struct Catalog<S: KvStore> {
    store: S,
    table: String,
    attribute: &'static str,
    seen: LruSet<String>,
}

impl<S: KvStore> Catalog<S> {
    pub fn new(store: S, table: String, attribute: &'static str, dedup_capacity: usize) -> Self {
        Self {
            store,
            table,
            attribute,
            seen: LruSet::new(dedup_capacity),
        }
    }

    pub fn spec(table: String, attribute: &'static str) -> TableSpec {
        TableSpec {
            name: table,
            hash: KeySchema::string("domain"),
            range: Some(KeySchema::string(attribute)),
            throughput: Throughput::new(1, 1),
        }
    }

    /// Record a value for a domain unless it was recently written.
    pub fn store(&self, domain: &str, value: &str) -> Result<(), SchemaError> {
        let dedup_key = format!("{domain}|{value}");
        if self.seen.contains(&dedup_key) {
            return Ok(());
        }

        let item = Item::new()
            .with_s("domain", domain)
            .with_s(self.attribute, value);
        self.store.put_item(&self.table, item, true)?;

        self.seen.add(dedup_key);
        Ok(())
    }

    /// All values recorded for a domain, in range-key order.
    pub fn list(&self, domain: &str) -> Result<Vec<String>, SchemaError> {
        let query = KvQuery::hash_eq(domain).attributes(vec![self.attribute.to_string()]);
        let items = self.store.query(&self.table, &query)?;

        Ok(items
            .into_iter()
            .filter_map(|item| item.get_s(self.attribute).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_testing::MemoryStore;

    fn catalog(store: &MemoryStore) -> Catalog<MemoryStore> {
        let spec = Catalog::<MemoryStore>::spec("metric_names".into(), "name");
        store.create_table(spec).unwrap();
        Catalog::new(store.clone(), "metric_names".into(), "name", 16)
    }

    #[test]
    fn lists_per_domain_in_order() {
        let store = MemoryStore::new();
        let catalog = catalog(&store);

        catalog.store("acme", "zeta").unwrap();
        catalog.store("acme", "alpha").unwrap();
        catalog.store("other", "foreign").unwrap();

        assert_eq!(catalog.list("acme").unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(catalog.list("other").unwrap(), vec!["foreign"]);
    }

    #[test]
    fn repeat_sightings_hit_the_dedup_cache() {
        let store = MemoryStore::new();
        let catalog = catalog(&store);

        catalog.store("acme", "cpu").unwrap();
        // a second store for the same pair must be a cache hit; dropping
        // the table underneath would make a real write fail
        store.delete_table("metric_names").unwrap();
        catalog.store("acme", "cpu").unwrap();
    }
}
