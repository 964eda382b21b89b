//! Sliding-window quantile maintenance over per-batch fee histograms.
//!
//! Each batch's own fees are bucketed into a sparse histogram
//! (`bucket_index -> count`, bucket width = `fee_approximation` satoshis)
//! and merged into a rolling window of the last `W` batches' histograms.
//! Snapshots are persisted one-per-batch so [`QuantileCalculator::open`]
//! can rebuild the rolling window from disk after a restart, and so
//! `remove_batches_ge` (rollback) can cleanly evict a suffix.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rocksdb::{WriteBatch, DB};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::BatchQuantileSnapshot;

const CF_QUANTILE_SNAPSHOTS: &str = "quantile_snapshots";

fn batch_key(batch_id: u64) -> [u8; 8] {
    batch_id.to_be_bytes()
}

type Histogram = BTreeMap<u64, u64>;

fn bucket_histogram(fees: &[u64], resolution: u64) -> Histogram {
    let resolution = resolution.max(1);
    let mut histogram = Histogram::new();
    for &fee in fees {
        *histogram.entry(fee / resolution).or_insert(0) += 1;
    }
    histogram
}

fn merge_into(rolling: &mut Histogram, addition: &Histogram) {
    for (&bucket, &count) in addition {
        *rolling.entry(bucket).or_insert(0) += count;
    }
}

fn subtract_from(rolling: &mut Histogram, removal: &Histogram) {
    for (&bucket, &count) in removal {
        if let Some(existing) = rolling.get_mut(&bucket) {
            *existing = existing.saturating_sub(count);
            if *existing == 0 {
                rolling.remove(&bucket);
            }
        }
    }
}

/// Smallest `v` such that the cumulative frequency of elements `<= v` is
/// `>= ceil(q * N)`, ties broken toward the lower candidate.
fn compute_quantile(rolling: &Histogram, resolution: u64, quantile: f64) -> u64 {
    let resolution = resolution.max(1);
    let total: u64 = rolling.values().sum();
    if total == 0 {
        return 0;
    }
    let target = (quantile * total as f64).ceil() as u64;
    let target = target.max(1);
    let mut cumulative = 0u64;
    for (&bucket, &count) in rolling.iter() {
        cumulative += count;
        if cumulative >= target {
            return bucket * resolution;
        }
    }
    // Unreachable unless target > total, which the `target.max(1)` / ceil
    // arithmetic above never produces for total > 0, but fall back to the
    // highest observed bucket defensively.
    rolling.keys().next_back().map(|&b| b * resolution).unwrap_or(0)
}

fn histogram_to_vector(histogram: &Histogram) -> Vec<(u64, u64)> {
    histogram.iter().map(|(&k, &v)| (k, v)).collect()
}

fn histogram_from_vector(vector: &[(u64, u64)]) -> Histogram {
    vector.iter().cloned().collect()
}

pub struct QuantileCalculator {
    db: Arc<DB>,
    resolution: u64,
    window_size_in_batches: usize,
    quantile: f64,
    /// Ascending by batch_id, contiguous, length <= window_size_in_batches.
    window: VecDeque<BatchQuantileSnapshot>,
    rolling: Histogram,
}

impl QuantileCalculator {
    /// Loads any persisted snapshots (there should be at most
    /// `window_size_in_batches` of them, contiguous) and rebuilds the
    /// rolling histogram from them.
    pub fn open(
        db: Arc<DB>,
        resolution: u64,
        window_size_in_batches: usize,
        quantile: f64,
    ) -> EngineResult<Self> {
        let cf = db
            .cf_handle(CF_QUANTILE_SNAPSHOTS)
            .ok_or_else(|| EngineError::PersistenceError(format!("{CF_QUANTILE_SNAPSHOTS} CF not found")))?;

        let mut window = VecDeque::new();
        let iter = db.iterator_cf(&cf, rocksdb::IteratorMode::Start);
        for item in iter {
            let (_key, value) =
                item.map_err(|e| EngineError::PersistenceError(format!("iterating quantile snapshots: {e}")))?;
            let snapshot: BatchQuantileSnapshot = bincode::deserialize(&value)
                .map_err(|e| EngineError::PersistenceError(format!("decoding quantile snapshot: {e}")))?;
            window.push_back(snapshot);
        }
        window.make_contiguous().sort_by_key(|s| s.batch_id);

        let mut rolling = Histogram::new();
        for snapshot in &window {
            merge_into(&mut rolling, &histogram_from_vector(&snapshot.frequency_vector));
        }

        Ok(Self { db, resolution, window_size_in_batches, quantile, window, rolling })
    }

    fn last_batch_id(&self) -> Option<u64> {
        self.window.back().map(|s| s.batch_id)
    }

    /// Adds one batch's fees to the window. Idempotent when called again
    /// with the same `(batch_id, fees)` as the most recently added batch
    /// (the crash-before-advancing-`last_seen_block` case).
    pub fn add(&mut self, batch_id: u64, fees: &[u64]) -> EngineResult<BatchQuantileSnapshot> {
        let this_histogram = bucket_histogram(fees, self.resolution);

        if let Some(last) = self.last_batch_id() {
            if batch_id == last {
                let existing = self.window.back().unwrap();
                let existing_histogram = histogram_from_vector(&existing.frequency_vector);
                if existing_histogram == this_histogram {
                    debug!(batch_id, "quantile add is a no-op replay of the last batch");
                    return Ok(existing.clone());
                }
                return Err(EngineError::Invariant(format!(
                    "batch {batch_id} re-added with different fees than its persisted snapshot"
                )));
            }
            if batch_id != last + 1 {
                return Err(EngineError::Invariant(format!(
                    "batch {batch_id} is not contiguous with last batch {last}"
                )));
            }
        }

        let mut rolling = self.rolling.clone();
        merge_into(&mut rolling, &this_histogram);

        let mut window = self.window.clone();
        window.push_back(BatchQuantileSnapshot {
            batch_id,
            quantile_value_satoshis: 0, // filled in below once computed
            frequency_vector: histogram_to_vector(&this_histogram),
        });

        let mut evicted = None;
        if window.len() > self.window_size_in_batches {
            let oldest = window.pop_front().unwrap();
            subtract_from(&mut rolling, &histogram_from_vector(&oldest.frequency_vector));
            evicted = Some(oldest.batch_id);
        }

        let quantile_value = compute_quantile(&rolling, self.resolution, self.quantile);
        let new_snapshot = BatchQuantileSnapshot {
            batch_id,
            quantile_value_satoshis: quantile_value,
            frequency_vector: histogram_to_vector(&this_histogram),
        };
        *window.back_mut().unwrap() = new_snapshot.clone();

        self.persist(&new_snapshot, evicted)?;

        self.window = window;
        self.rolling = rolling;
        Ok(new_snapshot)
    }

    fn persist(&self, snapshot: &BatchQuantileSnapshot, evicted: Option<u64>) -> EngineResult<()> {
        let cf = self
            .db
            .cf_handle(CF_QUANTILE_SNAPSHOTS)
            .ok_or_else(|| EngineError::PersistenceError(format!("{CF_QUANTILE_SNAPSHOTS} CF not found")))?;

        let mut batch = WriteBatch::default();
        let value = bincode::serialize(snapshot)
            .map_err(|e| EngineError::PersistenceError(format!("encoding quantile snapshot: {e}")))?;
        batch.put_cf(&cf, batch_key(snapshot.batch_id), value);
        if let Some(evicted_id) = evicted {
            batch.delete_cf(&cf, batch_key(evicted_id));
        }

        self.db
            .write(batch)
            .map_err(|e| EngineError::PersistenceError(format!("writing quantile snapshot: {e}")))
    }

    /// Returns the persisted quantile value for `batch_id`, if still within
    /// the window.
    pub fn quantile(&self, batch_id: u64) -> Option<u64> {
        self.window
            .iter()
            .find(|s| s.batch_id == batch_id)
            .map(|s| s.quantile_value_satoshis)
    }

    /// Drops all snapshots with `batch_id >= batch_id` and rebuilds the
    /// rolling histogram from what remains. Used by rollback.
    pub fn remove_batches_ge(&mut self, batch_id: u64) -> EngineResult<()> {
        let cf = self
            .db
            .cf_handle(CF_QUANTILE_SNAPSHOTS)
            .ok_or_else(|| EngineError::PersistenceError(format!("{CF_QUANTILE_SNAPSHOTS} CF not found")))?;

        let to_remove: Vec<u64> = self
            .window
            .iter()
            .filter(|s| s.batch_id >= batch_id)
            .map(|s| s.batch_id)
            .collect();

        let mut batch = WriteBatch::default();
        for id in &to_remove {
            batch.delete_cf(&cf, batch_key(*id));
        }
        self.db
            .write(batch)
            .map_err(|e| EngineError::PersistenceError(format!("removing quantile snapshots: {e}")))?;

        self.window.retain(|s| s.batch_id < batch_id);
        self.rolling = Histogram::new();
        for snapshot in &self.window {
            merge_into(&mut self.rolling, &histogram_from_vector(&snapshot.frequency_vector));
        }
        Ok(())
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// The window's snapshots, ascending by `batch_id`. For inspection
    /// tooling; the engine itself only ever needs [`Self::quantile`].
    pub fn snapshots(&self) -> impl Iterator<Item = &BatchQuantileSnapshot> {
        self.window.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    fn open_test_db() -> (TempDir, Arc<DB>) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![ColumnFamilyDescriptor::new(CF_QUANTILE_SNAPSHOTS, Options::default())];
        let db = DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap();
        (dir, Arc::new(db))
    }

    #[test]
    fn single_batch_quantile() {
        let (_dir, db) = open_test_db();
        let mut calc = QuantileCalculator::open(db, 1, 2, 0.5).unwrap();
        let snap = calc.add(0, &[10, 20, 30]).unwrap();
        assert_eq!(snap.quantile_value_satoshis, 20);
        assert_eq!(calc.quantile(0), Some(20));
    }

    #[test]
    fn rolling_window_merges_until_it_overflows() {
        let (_dir, db) = open_test_db();
        let mut calc = QuantileCalculator::open(db, 1, 2, 0.5).unwrap();
        calc.add(0, &[10, 20, 30]).unwrap();
        let snap = calc.add(1, &[100, 200, 300]).unwrap();
        // rolling = {10,20,30,100,200,300}, N=6, ceil(0.5*6)=3 -> 3rd smallest = 30.
        assert_eq!(snap.quantile_value_satoshis, 30);
        assert_eq!(calc.window_len(), 2);

        // A third batch evicts batch 0.
        let snap2 = calc.add(2, &[5, 6, 7]).unwrap();
        assert_eq!(calc.window_len(), 2);
        assert_eq!(calc.quantile(0), None);
        // rolling = {100,200,300,5,6,7}, N=6, ceil(3)=3 -> sorted {5,6,7,100,200,300} 3rd=7.
        assert_eq!(snap2.quantile_value_satoshis, 7);
    }

    #[test]
    fn add_is_idempotent_for_same_batch_and_fees() {
        let (_dir, db) = open_test_db();
        let mut calc = QuantileCalculator::open(db, 1, 2, 0.5).unwrap();
        let first = calc.add(0, &[10, 20, 30]).unwrap();
        let second = calc.add(0, &[10, 20, 30]).unwrap();
        assert_eq!(first, second);
        assert_eq!(calc.window_len(), 1);
    }

    #[test]
    fn add_rejects_non_contiguous_batch() {
        let (_dir, db) = open_test_db();
        let mut calc = QuantileCalculator::open(db, 1, 2, 0.5).unwrap();
        calc.add(0, &[10]).unwrap();
        let err = calc.add(5, &[20]).unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[test]
    fn remove_batches_ge_truncates_and_rebuilds() {
        let (_dir, db) = open_test_db();
        let mut calc = QuantileCalculator::open(db, 1, 3, 0.5).unwrap();
        calc.add(0, &[10, 20, 30]).unwrap();
        calc.add(1, &[100, 200, 300]).unwrap();
        calc.add(2, &[5, 6, 7]).unwrap();
        calc.remove_batches_ge(1).unwrap();
        assert_eq!(calc.window_len(), 1);
        assert_eq!(calc.quantile(0), Some(20));
        assert_eq!(calc.quantile(1), None);
        assert_eq!(calc.quantile(2), None);
    }

    #[test]
    fn reopen_rebuilds_rolling_state_from_disk() {
        let (_dir, db) = open_test_db();
        {
            let mut calc = QuantileCalculator::open(Arc::clone(&db), 1, 2, 0.5).unwrap();
            calc.add(0, &[10, 20, 30]).unwrap();
            calc.add(1, &[100, 200, 300]).unwrap();
        }
        let calc = QuantileCalculator::open(Arc::clone(&db), 1, 2, 0.5).unwrap();
        assert_eq!(calc.quantile(0), Some(20));
        assert_eq!(calc.quantile(1), Some(30));
        assert_eq!(calc.window_len(), 2);
    }
}
