// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-peer Bloom filter.
//!
//! Records transaction hashes a peer is believed to already know. Only used to
//! skip sends: a false positive costs one redundant skip, and inserted items
//! always test positive.
//!
//! Sizing:
//! - m = -n·ln(p) / ln(2)²
//! - k = (m/n)·ln(2), clamped to 1..=16
//!
//! Positions use double hashing over MurmurHash3 x64/128 with seeds 0 and 1:
//! `h(i) = h1 + i·h2 mod m`.

use bitvec::prelude::*;
use std::f64::consts::LN_2;
use std::io::Cursor;

const MAX_HASHES: usize = 16;

fn murmur(element: &[u8], seed: u32) -> u64 {
    let mut cursor = Cursor::new(element);
    murmur3::murmur3_x64_128(&mut cursor, seed).unwrap_or(0) as u64
}

/// Bit count and hash count for `expected` items at false-positive rate `fpr`.
pub fn optimal_parameters(expected: usize, fpr: f64) -> (usize, usize) {
    let n = expected.max(1) as f64;
    let p = if fpr.is_finite() && fpr > 0.0 && fpr < 1.0 {
        fpr
    } else {
        0.01
    };
    let m = ((-n * p.ln()) / (LN_2 * LN_2)).ceil().max(8.0) as usize;
    let k = ((m as f64 / n) * LN_2).round() as usize;
    (m, k.clamp(1, MAX_HASHES))
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: BitVec<u8, Lsb0>,
    hashes: usize,
    inserted: usize,
}

impl BloomFilter {
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let (m, k) = optimal_parameters(expected_items, false_positive_rate);
        Self {
            bits: bitvec![u8, Lsb0; 0; m],
            hashes: k,
            inserted: 0,
        }
    }

    fn positions(&self, element: &[u8]) -> impl Iterator<Item = usize> {
        let h1 = murmur(element, 0);
        let h2 = murmur(element, 1);
        let m = self.bits.len() as u64;
        (0..self.hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn insert(&mut self, element: &[u8]) {
        let positions: Vec<usize> = self.positions(element).collect();
        for pos in positions {
            self.bits.set(pos, true);
        }
        self.inserted += 1;
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        self.positions(element).all(|pos| self.bits[pos])
    }

    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.inserted = 0;
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn size_bits(&self) -> usize {
        self.bits.len()
    }

    pub fn hash_count(&self) -> usize {
        self.hashes
    }

    /// Estimated false-positive rate at the current fill: (1 - e^(-kn/m))^k.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.hashes as f64;
        let exponent = -k * self.inserted as f64 / self.bits.len() as f64;
        (1.0 - exponent.exp()).powi(self.hashes as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimal_parameters() {
        let (m, k) = optimal_parameters(10_000, 0.01);
        // ~9.59 bits per element, ~7 hashes
        assert!((95_000..97_000).contains(&m), "m = {}", m);
        assert_eq!(k, 7);
    }

    #[test]
    fn test_optimal_parameters_degenerate_inputs() {
        let (m, k) = optimal_parameters(0, 0.01);
        assert!(m >= 8);
        assert!(k >= 1);
        let (_, k) = optimal_parameters(100, 0.0);
        assert!((1..=MAX_HASHES).contains(&k));
        let (_, k) = optimal_parameters(100, f64::NAN);
        assert!((1..=MAX_HASHES).contains(&k));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        let items: Vec<String> = (0..2_000).map(|i| format!("hash-{}", i)).collect();
        for item in &items {
            filter.insert(item.as_bytes());
        }
        // Even past capacity, every inserted item tests positive.
        assert!(items.iter().all(|i| filter.contains(i.as_bytes())));
        assert_eq!(filter.inserted(), 2_000);
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(format!("in-{}", i).as_bytes());
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.contains(format!("out-{}", i).as_bytes()))
            .count();
        // 1% target; allow generous slack
        assert!(false_positives < 500, "fp = {}", false_positives);
        assert!(filter.estimated_fpr() < 0.05);
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.insert(b"abc");
        assert!(filter.contains(b"abc"));
        filter.clear();
        assert!(!filter.contains(b"abc"));
        assert_eq!(filter.inserted(), 0);
    }
}
