//! Abstract contract for the backing hash+range wide-column store.
//!
//! The engine only ever talks to this trait. Implementations live in
//! `tempo-redb` (embedded, durable) and `tempo-testing` (in-memory); a
//! hosted-store adapter would slot in the same way.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table not active: {0}")]
    TableNotActive(String),

    #[error("throttled on table: {0}")]
    Throttled(String),

    #[error("conflicting operation on table: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl KvError {
    pub fn transport<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        KvError::Transport(value.into())
    }
}

/// Key attribute types supported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarKind {
    S,
    N,
}

/// A key attribute value. Tables never mix kinds within one key slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarKey {
    N(i64),
    S(String),
}

impl ScalarKey {
    pub fn kind(&self) -> ScalarKind {
        match self {
            ScalarKey::S(_) => ScalarKind::S,
            ScalarKey::N(_) => ScalarKind::N,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarKey::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarKey::N(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for ScalarKey {
    fn from(s: &str) -> Self {
        ScalarKey::S(s.to_string())
    }
}

impl From<String> for ScalarKey {
    fn from(s: String) -> Self {
        ScalarKey::S(s)
    }
}

impl From<i64> for ScalarKey {
    fn from(n: i64) -> Self {
        ScalarKey::N(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySchema {
    pub name: String,
    pub kind: ScalarKind,
}

impl KeySchema {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ScalarKind::S,
        }
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ScalarKind::N,
        }
    }
}

/// Provisioned capacity targets, modifiable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub read: u64,
    pub write: u64,
}

impl Throughput {
    pub fn new(read: u64, write: u64) -> Self {
        Self { read, write }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub hash: KeySchema,
    pub range: Option<KeySchema>,
    pub throughput: Throughput,
}

impl TableSpec {
    fn extract_key(&self, schema: &KeySchema, item: &Item) -> Result<ScalarKey, KvError> {
        let key = item
            .get(&schema.name)
            .and_then(Attr::as_scalar)
            .ok_or_else(|| {
                KvError::transport(format!(
                    "item for table {} is missing key attribute {}",
                    self.name, schema.name
                ))
            })?;

        if key.kind() != schema.kind {
            return Err(KvError::transport(format!(
                "key attribute {} has the wrong type for table {}",
                schema.name, self.name
            )));
        }

        Ok(key)
    }

    /// Pull the primary key out of an item, validating attribute types
    /// against the schema.
    pub fn item_key(&self, item: &Item) -> Result<(ScalarKey, Option<ScalarKey>), KvError> {
        let hash = self.extract_key(&self.hash, item)?;
        let range = match &self.range {
            Some(schema) => Some(self.extract_key(schema, item)?),
            None => None,
        };

        Ok((hash, range))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableStatus {
    Creating,
    Active,
    Deleting,
    Updating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDesc {
    pub status: TableStatus,
    pub throughput: Throughput,
}

/// An item attribute: a key scalar or an opaque value payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    S(String),
    N(i64),
    V(Value),
}

impl Attr {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attr::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Attr::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Attr::V(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<ScalarKey> {
        match self {
            Attr::S(s) => Some(ScalarKey::S(s.clone())),
            Attr::N(n) => Some(ScalarKey::N(*n)),
            Attr::V(_) => None,
        }
    }
}

impl From<ScalarKey> for Attr {
    fn from(key: ScalarKey) -> Self {
        match key {
            ScalarKey::S(s) => Attr::S(s),
            ScalarKey::N(n) => Attr::N(n),
        }
    }
}

/// A stored row: attribute name to attribute value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item(pub BTreeMap<String, Attr>);

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_s(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), Attr::S(value.into()));
        self
    }

    pub fn with_n(mut self, name: impl Into<String>, value: i64) -> Self {
        self.0.insert(name.into(), Attr::N(value));
        self
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), Attr::V(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Attr> {
        self.0.get(name)
    }

    pub fn get_s(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Attr::as_str)
    }

    pub fn get_n(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Attr::as_i64)
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.get(name).and_then(Attr::as_value)
    }

    /// Keep only the named attributes, mirroring a projection expression.
    pub fn project(mut self, attributes: &[String]) -> Self {
        self.0.retain(|name, _| attributes.iter().any(|a| a == name));
        self
    }
}

/// A range query against a single hash key.
#[derive(Debug, Clone)]
pub struct KvQuery {
    pub hash: ScalarKey,
    /// Inclusive range-key bounds; `None` scans the whole hash key.
    pub range: Option<(ScalarKey, ScalarKey)>,
    /// Projection; `None` returns full items.
    pub attributes: Option<Vec<String>>,
    pub consistent: bool,
    pub reverse: bool,
}

impl KvQuery {
    pub fn hash_eq(hash: impl Into<ScalarKey>) -> Self {
        Self {
            hash: hash.into(),
            range: None,
            attributes: None,
            consistent: false,
            reverse: false,
        }
    }

    pub fn between(mut self, low: impl Into<ScalarKey>, high: impl Into<ScalarKey>) -> Self {
        self.range = Some((low.into(), high.into()));
        self
    }

    pub fn attributes(mut self, attributes: Vec<String>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn consistent(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }
}

/// Accumulates puts for one table and sends them in bulk on flush.
pub trait KvBatch: Send + 'static {
    fn put(&mut self, item: Item) -> Result<(), KvError>;
    fn flush(&mut self) -> Result<(), KvError>;
}

/// The store contract. Cheap to clone; implementations share their
/// connection state internally.
pub trait KvStore: Clone + Send + Sync + 'static {
    type Batch: KvBatch;

    fn create_table(&self, spec: TableSpec) -> Result<(), KvError>;

    fn describe_table(&self, name: &str) -> Result<TableDesc, KvError>;

    fn update_throughput(&self, name: &str, throughput: Throughput) -> Result<(), KvError>;

    fn delete_table(&self, name: &str) -> Result<(), KvError>;

    /// `overwrite = false` fails with [`KvError::Conflict`] when the key
    /// already exists.
    fn put_item(&self, name: &str, item: Item, overwrite: bool) -> Result<(), KvError>;

    /// Remove a single row by primary key. Removing an absent row is not
    /// an error.
    fn delete_item(
        &self,
        name: &str,
        hash: ScalarKey,
        range: Option<ScalarKey>,
    ) -> Result<(), KvError>;

    fn batch(&self, name: &str) -> Result<Self::Batch, KvError>;

    fn query(&self, name: &str, query: &KvQuery) -> Result<Vec<Item>, KvError>;

    fn scan(&self, name: &str) -> Result<Vec<Item>, KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_accessors_distinguish_attr_kinds() {
        let item = Item::new()
            .with_s("domain", "acme")
            .with_n("toffset", 42)
            .with_value("value", Value::Dec(0.5));

        assert_eq!(item.get_s("domain"), Some("acme"));
        assert_eq!(item.get_n("toffset"), Some(42));
        assert_eq!(item.get_value("value"), Some(&Value::Dec(0.5)));
        assert_eq!(item.get_s("toffset"), None);
    }

    #[test]
    fn projection_drops_unlisted_attributes() {
        let item = Item::new().with_s("a", "1").with_s("b", "2");
        let projected = item.project(&["a".to_string()]);

        assert_eq!(projected.get_s("a"), Some("1"));
        assert!(projected.get("b").is_none());
    }
}
