//! Assigns prefix-cluster ids to request keys so the planner can group
//! requests that are likely to share a cache prefix before scoring them.
//!
//! Two pure assignment modes are provided: plain hash bucketing, and a
//! MinHash + banding scheme for near-duplicate detection over k-shingles of
//! the key text. Both are stateless functions over a slice of keys — no
//! incremental clustering state is kept across calls.

use std::collections::HashMap;

use bcache_model::{Error, Result};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Hashes `key` into one of `num_buckets` non-negative bucket ids.
pub fn hash_bucket(key: &str, num_buckets: u32) -> i64 {
    if num_buckets == 0 {
        return 0;
    }
    (xxh3_64(key.as_bytes()) % num_buckets as u64) as i64
}

/// Assigns each key to a bucket id via plain hashing (no shingling).
pub fn assign_pclusters(keys: &[String], num_buckets: u32) -> Vec<i64> {
    keys.iter().map(|k| hash_bucket(k, num_buckets)).collect()
}

fn hash_with_seed(s: &str, seed: u64) -> u64 {
    xxh3_64_with_seed(s.as_bytes(), seed)
}

/// Splits `s` into overlapping k-character shingles. Strings shorter than
/// `k` produce a single shingle equal to the whole string.
fn k_shingles(s: &str, k: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= k {
        return vec![s.to_string()];
    }
    (0..=chars.len() - k)
        .map(|i| chars[i..i + k].iter().collect())
        .collect()
}

fn minhash_signature(key: &str, num_hashes: u32, k: usize) -> Vec<u64> {
    let shingles = k_shingles(key, k);
    (0..num_hashes)
        .map(|seed| {
            shingles
                .iter()
                .map(|sh| hash_with_seed(sh, seed as u64))
                .min()
                .unwrap_or(0)
        })
        .collect()
}

/// Assigns prefix-cluster ids using MinHash signatures banded into groups,
/// so near-duplicate keys collide in at least one band with high
/// probability. `num_hashes` must be evenly divisible by `bands`.
///
/// Cluster ids are dense (`0..n`), assigned in order of first appearance, so
/// the result is deterministic for a given input order but the ids
/// themselves carry no meaning beyond grouping.
pub fn assign_pclusters_minhash(
    keys: &[String],
    num_hashes: u32,
    bands: u32,
    k_shingle: u32,
) -> Result<Vec<i64>> {
    if bands == 0 || num_hashes % bands != 0 {
        return Err(Error::InvalidInput(format!(
            "num_hashes ({num_hashes}) must be an exact multiple of bands ({bands})"
        )));
    }
    let rows_per_band = (num_hashes / bands) as usize;
    let k = k_shingle.max(1) as usize;

    let mut next_id: i64 = 0;
    let mut band_sig_to_id: HashMap<Vec<u64>, i64> = HashMap::new();
    let mut out = Vec::with_capacity(keys.len());

    for key in keys {
        let sig = minhash_signature(key, num_hashes, k);
        // The cluster id is determined by the first band's signature slice;
        // this mirrors banding's "any matching band is enough" intuition
        // while keeping assignment a single deterministic pass.
        let band0: Vec<u64> = sig[0..rows_per_band].to_vec();
        let id = *band_sig_to_id.entry(band0).or_insert_with(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        out.push(id);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bucket_is_deterministic_and_in_range() {
        let b1 = hash_bucket("tenant-a:layer-3", 16);
        let b2 = hash_bucket("tenant-a:layer-3", 16);
        assert_eq!(b1, b2);
        assert!((0..16).contains(&b1));
    }

    #[test]
    fn minhash_rejects_non_divisible_bands() {
        let keys = vec!["abc".to_string()];
        let err = assign_pclusters_minhash(&keys, 10, 3, 5).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn minhash_groups_near_duplicate_prefixes() {
        let keys = vec![
            "the quick brown fox jumps".to_string(),
            "the quick brown fox leaps".to_string(),
            "a completely different sentence entirely".to_string(),
        ];
        let ids = assign_pclusters_minhash(&keys, 32, 8, 5).unwrap();
        assert_eq!(ids.len(), 3);
        // Near-duplicate prefixes land in the same cluster far more often
        // than an unrelated string; assert the unrelated one diverges.
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn minhash_assignment_is_pure() {
        let keys = vec!["abcdefgh".to_string(), "abcdefgi".to_string()];
        let first = assign_pclusters_minhash(&keys, 16, 4, 3).unwrap();
        let second = assign_pclusters_minhash(&keys, 16, 4, 3).unwrap();
        assert_eq!(first, second);
    }
}
