//! Key codec: time bucketing, tag strings, and the composite row keys that
//! make arbitrary (domain, metric, tags) combinations range-scannable on a
//! hash+range store.
//!
//! Layout summary:
//! - index hash key: `domain|metric`
//! - index range key: `<tbase>|<tag_string>`
//! - datapoint hash key: SHA-1 hex of `index_hash_key|index_range_key`
//! - datapoint range key: `toffset`, the millisecond offset into the block

use std::sync::OnceLock;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{TagFilter, TagSet, Timestamp};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed index key: {0}")]
    Malformed(String),

    #[error("invalid bucketing: {0}")]
    InvalidBucketing(String),
}

/// Retention geometry: how history is cut into ring blocks.
///
/// `blocks` includes the extra bumper slot so the ring can hold the next
/// block while the oldest one is still readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucketing {
    block_size: Timestamp,
    blocks: usize,
}

impl Bucketing {
    pub fn new(history: Timestamp, history_blocks: usize) -> Result<Self, KeyError> {
        if history <= 0 || history_blocks == 0 || history % history_blocks as Timestamp != 0 {
            return Err(KeyError::InvalidBucketing(format!(
                "history {history} is not divisible into {history_blocks} blocks"
            )));
        }

        Ok(Self {
            block_size: history / history_blocks as Timestamp,
            blocks: history_blocks + 1,
        })
    }

    pub fn block_size(&self) -> Timestamp {
        self.block_size
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Total span covered by the ring, bumper included.
    pub fn history(&self) -> Timestamp {
        self.blocks as Timestamp * self.block_size
    }

    /// Queryable span: the ring minus the bumper slot.
    pub fn available_history(&self) -> Timestamp {
        (self.blocks as Timestamp - 1) * self.block_size
    }

    /// Round a timestamp down to the start of its block.
    pub fn base_time(&self, t: Timestamp) -> Timestamp {
        t - t.rem_euclid(self.block_size)
    }

    /// Offset of a timestamp into its block, always in `[0, block_size)`.
    pub fn offset_time(&self, t: Timestamp) -> Timestamp {
        t.rem_euclid(self.block_size)
    }

    /// Ring slot index for a timestamp.
    pub fn block_pos(&self, t: Timestamp) -> usize {
        (self.base_time(t).rem_euclid(self.history()) / self.block_size) as usize
    }
}

/// Canonical tag serialization: entries sorted by name, `name=value`
/// pairs joined by `;`. The empty tagset is the empty string.
pub fn tag_string(tags: &TagSet) -> String {
    tags.iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Inverse of [`tag_string`]; each entry splits on the first `=`.
pub fn parse_tag_string(s: &str) -> Result<TagSet, KeyError> {
    if s.is_empty() {
        return Ok(TagSet::new());
    }

    s.split(';')
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .ok_or_else(|| KeyError::Malformed(format!("tag entry without '=': {entry}")))
        })
        .collect()
}

pub fn index_hash_key(domain: &str, metric: &str) -> String {
    format!("{domain}|{metric}")
}

pub fn index_range_key(bucketing: &Bucketing, t: Timestamp, tags: &TagSet) -> String {
    format!("{}|{}", bucketing.base_time(t), tag_string(tags))
}

/// Datapoint hash key: SHA-1 hex digest over the concatenated index key
/// components. Hashing spreads hot metrics across the store's partitions.
pub fn datapoint_row_key(
    bucketing: &Bucketing,
    domain: &str,
    metric: &str,
    t: Timestamp,
    tags: &TagSet,
) -> String {
    let plain = format!(
        "{}|{}",
        index_hash_key(domain, metric),
        index_range_key(bucketing, t, tags)
    );
    hash_row_key(&plain)
}

fn hash_row_key(plain: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedKey {
    tbase: Timestamp,
    domain: String,
    metric: String,
    tag_string: String,
    tags: TagSet,
}

/// A stored index row: the `(index_hash_key, index_range_key)` pair.
///
/// Components are parsed on first access and memoized; a row with a
/// corrupt key reports [`KeyError`] from every accessor.
#[derive(Debug, Clone)]
pub struct IndexKey {
    hash_key: String,
    range_key: String,
    parsed: OnceLock<Result<ParsedKey, KeyError>>,
}

impl IndexKey {
    pub fn new(hash_key: impl Into<String>, range_key: impl Into<String>) -> Self {
        Self {
            hash_key: hash_key.into(),
            range_key: range_key.into(),
            parsed: OnceLock::new(),
        }
    }

    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    pub fn range_key(&self) -> &str {
        &self.range_key
    }

    fn parsed(&self) -> Result<&ParsedKey, KeyError> {
        self.parsed
            .get_or_init(|| {
                let (tbase, tag_string) = self
                    .range_key
                    .split_once('|')
                    .ok_or_else(|| KeyError::Malformed(self.range_key.clone()))?;

                let tbase: Timestamp = tbase
                    .parse()
                    .map_err(|_| KeyError::Malformed(self.range_key.clone()))?;

                let (domain, metric) = self
                    .hash_key
                    .split_once('|')
                    .ok_or_else(|| KeyError::Malformed(self.hash_key.clone()))?;

                Ok(ParsedKey {
                    tbase,
                    domain: domain.to_string(),
                    metric: metric.to_string(),
                    tag_string: tag_string.to_string(),
                    tags: parse_tag_string(tag_string)?,
                })
            })
            .as_ref()
            .map_err(|e| e.clone())
    }

    pub fn tbase(&self) -> Result<Timestamp, KeyError> {
        Ok(self.parsed()?.tbase)
    }

    pub fn domain(&self) -> Result<&str, KeyError> {
        Ok(&self.parsed()?.domain)
    }

    pub fn metric(&self) -> Result<&str, KeyError> {
        Ok(&self.parsed()?.metric)
    }

    pub fn tag_string(&self) -> Result<&str, KeyError> {
        Ok(&self.parsed()?.tag_string)
    }

    pub fn tags(&self) -> Result<&TagSet, KeyError> {
        Ok(&self.parsed()?.tags)
    }

    /// The datapoint hash key this index row points at.
    pub fn to_datapoint_row_key(&self) -> Result<String, KeyError> {
        let plain = format!("{}|{}", self.hash_key, self.range_key);
        Ok(hash_row_key(&plain))
    }

    /// True iff for every `(name, values)` entry of the filter this key
    /// carries the tag and its value is among the permitted ones. The
    /// empty filter matches everything.
    pub fn has_tags(&self, filter: &TagFilter) -> Result<bool, KeyError> {
        let tags = self.tags()?;

        Ok(filter.iter().all(|(name, values)| {
            tags.get(name).map(|v| values.contains(v)).unwrap_or(false)
        }))
    }
}

/// Intersect `[start, end]` with the block a key lives in, expressed as
/// offsets into that block.
pub fn offset_range(
    bucketing: &Bucketing,
    key: &IndexKey,
    start: Timestamp,
    end: Timestamp,
) -> Result<(Timestamp, Timestamp), KeyError> {
    let tbase = key.tbase()?;
    let mut range = (0, bucketing.block_size());

    if tbase == bucketing.base_time(start) {
        range.0 = bucketing.offset_time(start);
    }
    if tbase == bucketing.base_time(end) {
        range.1 = bucketing.offset_time(end);
    }

    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucketing() -> Bucketing {
        Bucketing::new(180_000, 3).unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn base_plus_offset_reconstructs_timestamp() {
        let b = bucketing();
        for t in [-120_001, -1, 0, 1, 59_999, 60_000, 61_234, 7_777_777] {
            assert_eq!(b.base_time(t) + b.offset_time(t), t);
            assert!(b.offset_time(t) >= 0);
            assert!(b.offset_time(t) < b.block_size());
        }
    }

    #[test]
    fn block_pos_is_periodic_over_ring() {
        let b = bucketing();
        let period = b.blocks() as Timestamp * b.block_size();
        for t in [0, 1, 59_999, 60_000, 150_000] {
            for k in [-2, -1, 1, 5] {
                assert_eq!(b.block_pos(t), b.block_pos(t + k * period));
            }
        }
    }

    #[test]
    fn bucketing_rejects_indivisible_history() {
        assert!(Bucketing::new(100, 3).is_err());
        assert!(Bucketing::new(0, 3).is_err());
    }

    #[test]
    fn tag_string_round_trip() {
        let t = tags(&[("b", "2"), ("a", "1"), ("c", "x=y")]);
        assert_eq!(tag_string(&t), "a=1;b=2;c=x=y");
        assert_eq!(parse_tag_string(&tag_string(&t)).unwrap(), t);
        assert_eq!(parse_tag_string("").unwrap(), TagSet::new());
    }

    #[test]
    fn parse_rejects_entry_without_equals() {
        assert!(parse_tag_string("novalue").is_err());
    }

    #[test]
    fn index_key_round_trips_to_row_key() {
        let b = bucketing();
        let t = tags(&[("host", "h1")]);

        let key = IndexKey::new(
            index_hash_key("acme", "cpu"),
            index_range_key(&b, 61_000, &t),
        );

        assert_eq!(key.domain().unwrap(), "acme");
        assert_eq!(key.metric().unwrap(), "cpu");
        assert_eq!(key.tbase().unwrap(), 60_000);
        assert_eq!(key.tags().unwrap(), &t);
        assert_eq!(
            key.to_datapoint_row_key().unwrap(),
            datapoint_row_key(&b, "acme", "cpu", 61_000, &t)
        );
    }

    #[test]
    fn malformed_keys_surface_errors() {
        let key = IndexKey::new("no-separator", "also-bad");
        assert!(key.tbase().is_err());
        assert!(key.domain().is_err());
    }

    #[test]
    fn tag_filter_semantics() {
        let b = bucketing();
        let key = IndexKey::new(
            index_hash_key("acme", "cpu"),
            index_range_key(&b, 0, &tags(&[("host", "h1")])),
        );

        assert!(key.has_tags(&TagFilter::new()).unwrap());

        let mut matching = TagFilter::new();
        matching.insert("host".into(), ["h1".to_string()].into());
        assert!(key.has_tags(&matching).unwrap());

        let mut wrong_value = TagFilter::new();
        wrong_value.insert("host".into(), ["h2".to_string()].into());
        assert!(!key.has_tags(&wrong_value).unwrap());

        let mut missing_name = TagFilter::new();
        missing_name.insert("dc".into(), ["us".to_string()].into());
        assert!(!key.has_tags(&missing_name).unwrap());
    }

    #[test]
    fn offset_range_clips_to_block_edges() {
        let b = bucketing();
        let t = tags(&[]);

        // key in the first block, query spanning past it
        let key = IndexKey::new(index_hash_key("d", "m"), index_range_key(&b, 0, &t));
        assert_eq!(offset_range(&b, &key, 10_000, 120_000).unwrap(), (10_000, b.block_size()));

        // key in the middle block of the same query
        let key = IndexKey::new(index_hash_key("d", "m"), index_range_key(&b, 60_000, &t));
        assert_eq!(offset_range(&b, &key, 10_000, 70_000).unwrap(), (0, 10_000));
    }
}
