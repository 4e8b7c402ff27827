// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod bit_array;

use crate::Slice;
use bit_array::{BitArrayBuilder, BitArrayReader};

/// Two 64-bit hashes, folded into `k` probe positions with double hashing
pub type CompositeHash = (u64, u64);

/// Hashes a key for filter membership.
#[must_use]
pub fn get_hash(key: &[u8]) -> CompositeHash {
    let h = xxhash_rust::xxh3::xxh3_128(key);

    #[allow(clippy::cast_possible_truncation)]
    ((h >> 64) as u64, h as u64)
}

/// Number of probes for a given bits-per-key setting.
#[must_use]
fn probe_count(bits_per_key: u8) -> usize {
    // ln(2) * bits per key is the optimum for a standard bloom filter
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    {
        ((f64::from(bits_per_key) * std::f64::consts::LN_2) as usize).max(1)
    }
}

/// A standard bloom filter over the keys of one L1 index block span
///
/// The on-disk representation is the raw bit array only; the bit count is
/// implied by the byte length and the probe count by the bucket's
/// `bloom_filter_bitnum`. Uses double hashing instead of `k` hash functions.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    inner: BitArrayReader,

    /// Bit count
    m: usize,

    /// Number of probes
    k: usize,
}

impl BloomFilter {
    /// Builds a filter over the buffered key hashes.
    #[must_use]
    pub fn from_hashes(hashes: &[CompositeHash], bits_per_key: u8) -> Self {
        let m = (hashes.len() * usize::from(bits_per_key)).next_multiple_of(8).max(8);
        let mut builder = BitArrayBuilder::with_capacity(m / 8);

        let k = probe_count(bits_per_key);

        for &(mut h1, mut h2) in hashes {
            for i in 1..=(k as u64) {
                #[allow(clippy::cast_possible_truncation)]
                let idx = (h1 % (m as u64)) as usize;
                builder.enable_bit(idx);

                h1 = h1.wrapping_add(h2);
                h2 = h2.wrapping_mul(i);
            }
        }

        Self {
            inner: BitArrayReader::new(builder.bytes().into()),
            m,
            k,
        }
    }

    /// Attaches to filter bytes read back from an index file.
    #[must_use]
    pub fn from_bytes(bytes: Slice, bits_per_key: u8) -> Self {
        let m = bytes.len() * 8;
        Self {
            inner: BitArrayReader::new(bytes),
            m,
            k: probe_count(bits_per_key),
        }
    }

    /// Returns the raw bytes of the filter.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    /// Returns `true` if the key may be contained.
    ///
    /// Will never have a false negative.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.contains_hash(get_hash(key))
    }

    /// Returns `true` if the hash may be contained.
    #[must_use]
    pub fn contains_hash(&self, hash: CompositeHash) -> bool {
        let (mut h1, mut h2) = hash;

        for i in 1..=(self.k as u64) {
            #[allow(clippy::cast_possible_truncation)]
            let idx = (h1 % (self.m as u64)) as usize;

            if !self.inner.get(idx) {
                return false;
            }

            h1 = h1.wrapping_add(h2);
            h2 = h2.wrapping_mul(i);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn filter_never_false_negative() {
        let keys: Vec<Vec<u8>> = (0..1_000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let hashes: Vec<_> = keys.iter().map(|k| get_hash(k)).collect();

        let filter = BloomFilter::from_hashes(&hashes, 10);

        for key in &keys {
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn filter_roundtrip_through_bytes() {
        let keys: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let hashes: Vec<_> = keys.iter().map(|k| get_hash(k)).collect();

        let filter = BloomFilter::from_hashes(&hashes, 10);
        let reloaded = BloomFilter::from_bytes(filter.bytes().into(), 10);

        for key in &keys {
            assert!(reloaded.contains(key));
        }
    }

    #[test]
    fn filter_rejects_most_absent_keys() {
        let keys: Vec<Vec<u8>> = (0..1_000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let hashes: Vec<_> = keys.iter().map(|k| get_hash(k)).collect();

        let filter = BloomFilter::from_hashes(&hashes, 10);

        let false_positives = (1_000..2_000u32)
            .filter(|i| filter.contains(&i.to_be_bytes()))
            .count();

        // ~1% FP rate at 10 bits per key; leave plenty of slack
        assert!(false_positives < 100, "{false_positives} false positives");
    }
}
