//! Core data model: composite transaction numbers, anchor records, and the
//! quantile-window snapshot persisted per batch.

use serde::{Deserialize, Serialize};

/// Bits reserved for `index_within_block` in a composite `transaction_number`.
pub const INDEX_BITS: u32 = 24;
/// Maximum in-block index that fits in `INDEX_BITS` bits.
pub const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;

/// `transaction_number = (block_height << 24) | index_within_block`.
///
/// Panics if `index` does not fit in 24 bits — callers must validate with
/// [`MAX_INDEX`] before constructing. Index values of -1 and 0x1000000 are
/// rejected.
pub fn construct_transaction_number(block_height: u32, index: u32) -> u64 {
    assert!(index <= MAX_INDEX, "index_within_block {} exceeds 24 bits", index);
    ((block_height as u64) << INDEX_BITS) | (index as u64)
}

/// `block_of(n) = n >> 24`.
pub fn block_of(transaction_number: u64) -> u32 {
    (transaction_number >> INDEX_BITS) as u32
}

/// `index_of(n) = n & 0xFFFFFF`.
pub fn index_of(transaction_number: u64) -> u32 {
    (transaction_number & (MAX_INDEX as u64)) as u32
}

/// `batch_id = block_height / batch_size_in_blocks`.
pub fn batch_id_of(block_height: u32, batch_size_in_blocks: u32) -> u64 {
    (block_height / batch_size_in_blocks) as u64
}

/// True when `height` is the last block of its batch, i.e. the block after
/// it starts a new batch: `(height + 1) % batch_size == 0`.
pub fn is_batch_boundary(height: u32, batch_size_in_blocks: u32) -> bool {
    (height + 1) % batch_size_in_blocks == 0
}

/// Rounds `height` up to the first block of the next batch boundary, i.e.
/// the smallest multiple of `batch_size_in_blocks` that is `>= height`.
pub fn batch_boundary_ceiling(height: u32, batch_size_in_blocks: u32) -> u32 {
    height.div_ceil(batch_size_in_blocks) * batch_size_in_blocks
}

/// One discovered anchor, extracted from a single qualifying transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub transaction_number: u64,
    pub block_height: u32,
    pub block_hash: String,
    pub anchor_payload: Vec<u8>,
    pub fee_paid: u64,
}

impl AnchorRecord {
    pub fn new(
        block_height: u32,
        index_within_block: u32,
        block_hash: String,
        anchor_payload: Vec<u8>,
        fee_paid: u64,
    ) -> Self {
        Self {
            transaction_number: construct_transaction_number(block_height, index_within_block),
            block_height,
            block_hash,
            anchor_payload,
            fee_paid,
        }
    }

    pub fn index_within_block(&self) -> u32 {
        index_of(self.transaction_number)
    }
}

/// A snapshot of the sliding-window quantile state as of one batch boundary.
///
/// `frequency_vector` is the sparse histogram (bucket index -> count)
/// covering only this batch's own observations; it is what gets added to /
/// subtracted from the rolling window when batches enter/leave it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchQuantileSnapshot {
    pub batch_id: u64,
    pub quantile_value_satoshis: u64,
    pub frequency_vector: Vec<(u64, u64)>,
}

/// Process-local, non-persisted pointer to the last block the engine has
/// fully processed. A durable projection of this is kept in the
/// `engine_state` column family so a restarted process resumes from its
/// last completed tick instead of genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSeenBlock {
    pub height: u32,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing { from: u32, to: u32 },
    Reverting,
    Halted,
}
