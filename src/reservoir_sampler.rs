//! Algorithm R reservoir sampling, deterministically seeded per block.
//!
//! The PRNG is a plain `rand::rngs::StdRng` seeded from a 32-byte digest of
//! the block hash, never the thread-local/global RNG — any two observers
//! seeding from the same block hash draw the same sample.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

pub struct ReservoirSampler {
    capacity: usize,
    rng: StdRng,
    reservoir: Vec<String>,
    seen: u64,
}

impl ReservoirSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rng: StdRng::from_seed(seed_from_bytes(b"uninitialized")),
            reservoir: Vec::with_capacity(capacity),
            seen: 0,
        }
    }

    /// Reseeds the PRNG from the block hash and clears the reservoir.
    pub fn reset(&mut self, block_hash: &str) {
        self.rng = StdRng::from_seed(seed_from_bytes(block_hash.as_bytes()));
        self.reservoir.clear();
        self.seen = 0;
    }

    /// Observes the next item in the stream (Algorithm R).
    pub fn observe(&mut self, item: String) {
        self.seen += 1;
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(item);
            return;
        }
        if self.capacity == 0 {
            return;
        }
        let j = self.rng.gen_range(0..self.seen);
        if (j as usize) < self.capacity {
            self.reservoir[j as usize] = item;
        }
    }

    pub fn sample(&self) -> &[String] {
        &self.reservoir
    }

    /// Drops the reservoir's contents without touching the seed (distinct
    /// from `reset`, which reseeds).
    pub fn clear(&mut self) {
        self.reservoir.clear();
        self.seen = 0;
    }
}

fn seed_from_bytes(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_everything_under_capacity() {
        let mut sampler = ReservoirSampler::new(10);
        sampler.reset("block-hash-a");
        for i in 0..5 {
            sampler.observe(format!("tx{i}"));
        }
        assert_eq!(sampler.sample().len(), 5);
    }

    #[test]
    fn caps_at_capacity() {
        let mut sampler = ReservoirSampler::new(3);
        sampler.reset("block-hash-a");
        for i in 0..1000 {
            sampler.observe(format!("tx{i}"));
        }
        assert_eq!(sampler.sample().len(), 3);
    }

    #[test]
    fn same_seed_same_sample() {
        let items: Vec<String> = (0..200).map(|i| format!("tx{i}")).collect();

        let mut a = ReservoirSampler::new(5);
        a.reset("deterministic-seed");
        for item in &items {
            a.observe(item.clone());
        }

        let mut b = ReservoirSampler::new(5);
        b.reset("deterministic-seed");
        for item in &items {
            b.observe(item.clone());
        }

        assert_eq!(a.sample(), b.sample());
    }

    #[test]
    fn different_seed_can_differ() {
        let items: Vec<String> = (0..200).map(|i| format!("tx{i}")).collect();

        let mut a = ReservoirSampler::new(5);
        a.reset("seed-one");
        for item in &items {
            a.observe(item.clone());
        }

        let mut b = ReservoirSampler::new(5);
        b.reset("seed-two");
        for item in &items {
            b.observe(item.clone());
        }

        assert_ne!(a.sample(), b.sample());
    }

    #[test]
    fn clear_keeps_seed_reset_reseeds() {
        let mut a = ReservoirSampler::new(5);
        a.reset("same-seed");
        for i in 0..50 {
            a.observe(format!("tx{i}"));
        }
        let after_clear_items = a.sample().to_vec();
        a.clear();
        assert!(a.sample().is_empty());

        // Replaying through clear (not reset) with the same items should
        // reproduce the same draws since the rng continues, not reseeds.
        // We only assert clear doesn't touch the seed by checking a fresh
        // reset with the same seed recreates the first pass deterministically.
        let mut b = ReservoirSampler::new(5);
        b.reset("same-seed");
        for i in 0..50 {
            b.observe(format!("tx{i}"));
        }
        assert_eq!(after_clear_items, b.sample());
    }
}
