//! Traits and machinery that are common to all tempo crates.
//!
//! Glossary:
//!  - `domain`: a tenant namespace; every key carries it and queries never
//!    mix domains.
//!  - `block`: one retention window's pair of (datapoints table, index
//!    table); blocks rotate through a fixed ring.
//!  - `tbase` / `toffset`: block-start time and in-block offset for a
//!    timestamp.

use std::collections::{BTreeMap, BTreeSet};

pub mod clock;
pub mod config;
pub mod keys;
pub mod kv;
pub mod lru;
pub mod pool;
pub mod value;
pub mod writer;

/// Epoch milliseconds, signed.
pub type Timestamp = i64;

/// Unordered tag metadata with unique names and single values.
pub type TagSet = BTreeMap<String, String>;

/// A tag filter: for each name, the set of permissible values.
pub type TagFilter = BTreeMap<String, BTreeSet<String>>;

/// Union of tagsets: each name maps to every value seen for it.
pub type TagMultiMap = BTreeMap<String, Vec<String>>;

pub use clock::Clock;
pub use config::{
    CacheConfig, ConfigError, MaintenanceConfig, QueryConfig, RetentionConfig, StorageConfig,
    ThroughputConfig, WriteConfig,
};
pub use keys::{Bucketing, IndexKey, KeyError};
pub use kv::{
    Attr, Item, KeySchema, KvBatch, KvError, KvQuery, KvStore, ScalarKey, ScalarKind, TableDesc,
    TableSpec, TableStatus, Throughput,
};
pub use lru::{LruMap, LruSet};
pub use pool::{ScheduledPool, TaskHandle, WorkerPool};
pub use value::Value;
pub use writer::BatchWriter;

/// Collapse a list of tagsets into the multi-map union of their entries.
///
/// `[{a: 1}, {a: 2, b: 3}]` becomes `{a: [1, 2], b: [3]}` with values
/// deduplicated and sorted.
pub fn to_multi_map<'a, I>(tagsets: I) -> TagMultiMap
where
    I: IntoIterator<Item = &'a TagSet>,
{
    let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for tags in tagsets {
        for (name, value) in tags {
            merged.entry(name.clone()).or_default().insert(value.clone());
        }
    }

    merged
        .into_iter()
        .map(|(name, values)| (name, values.into_iter().collect()))
        .collect()
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

    #[test]
    fn multi_map_merges_and_dedups() {
        let a = tags(&[("host", "h1"), ("dc", "us")]);
        let b = tags(&[("host", "h2"), ("dc", "us")]);

        let merged = to_multi_map([&a, &b]);

        assert_eq!(merged["host"], vec!["h1", "h2"]);
        assert_eq!(merged["dc"], vec!["us"]);
    }

    #[test]
    fn multi_map_of_nothing_is_empty() {
        let none: [&TagSet; 0] = [];
        assert!(to_multi_map(none).is_empty());
    }
}
