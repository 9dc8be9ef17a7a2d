//! Composite key encoding for the redb backend.
//!
//! All multi-byte integers are encoded big-endian with the sign bit
//! flipped so byte order matches numeric order. Composite keys carry a
//! two-byte hash-key length prefix, which keeps every row of one hash key
//! inside a single contiguous byte range.

use tempo_core::ScalarKey;

/// Order-preserving i64 encoding.
pub fn encode_i64(n: i64) -> [u8; 8] {
    ((n as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> i64 {
    debug_assert!(bytes.len() >= 8);
    (u64::from_be_bytes(bytes[..8].try_into().unwrap()) ^ (1 << 63)) as i64
}

pub fn encode_scalar(key: &ScalarKey) -> Vec<u8> {
    match key {
        ScalarKey::S(s) => s.as_bytes().to_vec(),
        ScalarKey::N(n) => encode_i64(*n).to_vec(),
    }
}

/// Prefix shared by every row of one hash key.
pub fn hash_prefix(hash: &ScalarKey) -> Vec<u8> {
    let bytes = encode_scalar(hash);
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    prefix.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(&bytes);
    prefix
}

/// Full row key: hash prefix plus the encoded range key, if any.
pub fn composite_key(hash: &ScalarKey, range: Option<&ScalarKey>) -> Vec<u8> {
    let mut key = hash_prefix(hash);
    if let Some(range) = range {
        key.extend_from_slice(&encode_scalar(range));
    }
    key
}

/// Smallest byte string strictly greater than every key starting with
/// `prefix`, or `None` when the prefix is all 0xFF.
pub fn prefix_successor(mut prefix: Vec<u8>) -> Option<Vec<u8>> {
    while let Some(last) = prefix.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return Some(prefix);
        }
        prefix.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i64_encoding_preserves_order() {
        let samples = [i64::MIN, -100, -1, 0, 1, 59_999, i64::MAX];
        for pair in samples.windows(2) {
            assert!(encode_i64(pair[0]) < encode_i64(pair[1]));
            assert_eq!(decode_i64(&encode_i64(pair[0])), pair[0]);
        }
    }

    #[test]
    fn composite_keys_of_one_hash_share_the_prefix() {
        let hash = ScalarKey::S("acme|cpu".into());
        let prefix = hash_prefix(&hash);

        let a = composite_key(&hash, Some(&ScalarKey::N(10)));
        let b = composite_key(&hash, Some(&ScalarKey::N(20)));

        assert!(a.starts_with(&prefix));
        assert!(b.starts_with(&prefix));
        assert!(a < b);
    }

    #[test]
    fn differing_hash_lengths_never_interleave() {
        // "ab" with range vs "abc" without: the length prefix keeps the
        // hash spaces disjoint
        let short = composite_key(&ScalarKey::S("ab".into()), Some(&ScalarKey::S("c".into())));
        let long = composite_key(&ScalarKey::S("abc".into()), None);
        assert_ne!(short, long);

        let successor = prefix_successor(hash_prefix(&ScalarKey::S("ab".into()))).unwrap();
        assert!(long >= successor || long < hash_prefix(&ScalarKey::S("ab".into())));
    }

    #[test]
    fn successor_of_all_ff_is_unbounded() {
        assert_eq!(prefix_successor(vec![0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(vec![0x01, 0xFF]), Some(vec![0x02]));
    }
}
