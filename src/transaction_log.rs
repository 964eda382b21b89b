//! Append-only, tail-truncate-only store of discovered anchors.
//!
//! Keyed by the composite `transaction_number` (big-endian, so RocksDB's
//! natural key order is chain order). Entries are appended strictly in
//! increasing `transaction_number` order and only ever removed from the
//! tail, by [`TransactionLog::remove_later_than`], during rollback.

use std::sync::Arc;

use rocksdb::{WriteBatch, DB};

use crate::error::{EngineError, EngineResult};
use crate::types::{construct_transaction_number, AnchorRecord};

const CF_TRANSACTIONS: &str = "transactions";

fn transaction_key(transaction_number: u64) -> [u8; 8] {
    transaction_number.to_be_bytes()
}

pub struct TransactionLog {
    db: Arc<DB>,
    last: Option<AnchorRecord>,
}

fn cf_handle(db: &DB) -> EngineResult<Arc<rocksdb::BoundColumnFamily<'_>>> {
    db.cf_handle(CF_TRANSACTIONS)
        .ok_or_else(|| EngineError::PersistenceError(format!("{CF_TRANSACTIONS} CF not found")))
}

impl TransactionLog {
    pub fn open(db: Arc<DB>) -> EngineResult<Self> {
        let last = {
            let cf = cf_handle(&db)?;
            db.iterator_cf(&cf, rocksdb::IteratorMode::End)
                .next()
                .transpose()
                .map_err(|e| EngineError::PersistenceError(format!("reading tail of transaction log: {e}")))?
                .map(|(_k, v)| decode(&v))
                .transpose()?
        };
        Ok(Self { db, last })
    }

    /// Appends one anchor record. Strictly increasing `transaction_number`
    /// is required for genuinely new records; re-appending a
    /// `transaction_number` that is already present — whether or not it is
    /// the current tail — is a no-op as long as the contents match (the
    /// crash-before-tick-completes replay case: a tick that reprocesses
    /// block 1 after block 3 was already committed must not be treated as
    /// out-of-order). Only a `transaction_number` that is neither the next
    /// expected one nor already present with identical contents is an
    /// `Invariant` violation.
    pub fn append(&mut self, record: AnchorRecord) -> EngineResult<()> {
        let cf = cf_handle(&self.db)?;

        if self.last.as_ref().is_some_and(|last| record.transaction_number <= last.transaction_number) {
            let key = transaction_key(record.transaction_number);
            let existing = self
                .db
                .get_cf(&cf, key)
                .map_err(|e| EngineError::PersistenceError(format!("looking up transaction {}: {e}", record.transaction_number)))?;
            return match existing.map(|bytes| decode(&bytes)).transpose()? {
                Some(existing) if existing == record => Ok(()),
                Some(_) => Err(EngineError::Invariant(format!(
                    "transaction_number {} re-appended with different contents",
                    record.transaction_number
                ))),
                None => Err(EngineError::Invariant(format!(
                    "transaction_number {} is not greater than last appended {} and not already present",
                    record.transaction_number,
                    self.last.as_ref().unwrap().transaction_number
                ))),
            };
        }

        let value = encode(&record)?;
        self.db
            .put_cf(&cf, transaction_key(record.transaction_number), value)
            .map_err(|e| EngineError::PersistenceError(format!("appending transaction: {e}")))?;
        self.last = Some(record);
        Ok(())
    }

    pub fn last(&self) -> Option<&AnchorRecord> {
        self.last.as_ref()
    }

    pub fn count(&self) -> EngineResult<u64> {
        let cf = cf_handle(&self.db)?;
        let mut n = 0u64;
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            item.map_err(|e| EngineError::PersistenceError(format!("counting transactions: {e}")))?;
            n += 1;
        }
        Ok(n)
    }

    /// Returns up to `limit` records with `transaction_number > after`, in
    /// ascending order. `after = None` means from the very beginning of the
    /// log, including a record at `transaction_number == 0` if one exists.
    pub fn later_than(&self, after: Option<u64>, limit: usize) -> EngineResult<Vec<AnchorRecord>> {
        let cf = cf_handle(&self.db)?;
        let start_key = match after {
            Some(txnum) => transaction_key(txnum.saturating_add(1)),
            None => transaction_key(0),
        };
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward));
        for item in iter {
            let (_k, v) = item.map_err(|e| EngineError::PersistenceError(format!("scanning transactions: {e}")))?;
            out.push(decode(&v)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Returns records at offsets `0, 1, 2, 4, 8, 16, ...` from the tail
    /// (one per offset that exists), used by rollback to binary-search for
    /// the deepest surviving record against upstream.
    pub fn exponentially_spaced(&self) -> EngineResult<Vec<AnchorRecord>> {
        let cf = cf_handle(&self.db)?;
        let mut probes = Vec::new();
        let mut target = 0u64;
        let mut idx = 0u64;
        let iter = self.db.iterator_cf(&cf, rocksdb::IteratorMode::End);
        for item in iter {
            let (_k, v) = item.map_err(|e| EngineError::PersistenceError(format!("scanning transactions: {e}")))?;
            if idx == target {
                probes.push(decode(&v)?);
                target = if target == 0 { 1 } else { target * 2 };
            }
            idx += 1;
        }
        Ok(probes)
    }

    /// Deletes all records with `transaction_number > txnum`.
    /// This is the primitive rollback operates on; callers that want to
    /// purge everything at-or-above a given block height pass
    /// `construct_transaction_number(height, 0) - 1`.
    pub fn remove_later_than(&mut self, txnum: u64) -> EngineResult<()> {
        let cf = cf_handle(&self.db)?;

        let mut keys_to_remove = Vec::new();
        if let Some(start) = txnum.checked_add(1) {
            let start_key = transaction_key(start);
            let iter = self
                .db
                .iterator_cf(&cf, rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward));
            for item in iter {
                let (k, _v) = item.map_err(|e| EngineError::PersistenceError(format!("scanning transactions: {e}")))?;
                keys_to_remove.push(k);
            }
        }
        // txnum == u64::MAX: nothing can be strictly greater, nothing to remove.

        let mut batch = WriteBatch::default();
        for key in &keys_to_remove {
            batch.delete_cf(&cf, key);
        }
        self.db
            .write(batch)
            .map_err(|e| EngineError::PersistenceError(format!("removing transactions: {e}")))?;

        self.last = self
            .db
            .iterator_cf(&cf, rocksdb::IteratorMode::End)
            .next()
            .transpose()
            .map_err(|e| EngineError::PersistenceError(format!("reloading tail: {e}")))?
            .map(|(_k, v)| decode(&v))
            .transpose()?;
        Ok(())
    }

    /// Removes every record at or after the first transaction number of
    /// `block_height` — used by rollback to purge anchors discovered at or
    /// above a reorganized height. Equivalent to
    /// `remove_later_than(construct_transaction_number(block_height, 0).wrapping_sub(1))`,
    /// expressed directly to avoid the underflow at `block_height == 0`.
    pub fn remove_later_than_block(&mut self, block_height: u32) -> EngineResult<()> {
        let threshold = construct_transaction_number(block_height, 0);
        match threshold.checked_sub(1) {
            Some(txnum) => self.remove_later_than(txnum),
            None => self.remove_later_than_from_start(),
        }
    }

    /// Removes every record in the log (threshold 0: everything is "later
    /// than" an empty log).
    fn remove_later_than_from_start(&mut self) -> EngineResult<()> {
        let cf = cf_handle(&self.db)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (k, _v) = item.map_err(|e| EngineError::PersistenceError(format!("scanning transactions: {e}")))?;
            keys.push(k);
        }
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(&cf, key);
        }
        self.db
            .write(batch)
            .map_err(|e| EngineError::PersistenceError(format!("removing transactions: {e}")))?;
        self.last = None;
        Ok(())
    }
}

fn encode(record: &AnchorRecord) -> EngineResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| EngineError::PersistenceError(format!("encoding anchor record: {e}")))
}

fn decode(bytes: &[u8]) -> EngineResult<AnchorRecord> {
    bincode::deserialize(bytes).map_err(|e| EngineError::PersistenceError(format!("decoding anchor record: {e}")))
}
