//! Pure block -> (anchor records, sampling candidates) extraction.
//!
//! Scans each transaction's outputs for an `OP_RETURN <hex-data>` script
//! whose decoded data begins with the configured prefix. At most one such
//! output is recognized per transaction; a transaction with two qualifying
//! outputs is rejected outright (neither anchored nor sampled).

use tracing::warn;

use crate::blockchain_client::{Block, Transaction};
use crate::types::AnchorRecord;

/// `fee_paid` is left at 0 here; the caller fills it in once it has done
/// the upstream input-value lookups. Extraction itself never makes network
/// calls, keeping it pure and trivially testable.
pub struct ExtractedAnchor {
    pub block_height: u32,
    pub index_within_block: u32,
    pub block_hash: String,
    pub anchor_payload: Vec<u8>,
    pub carrying_txid: String,
}

pub struct ExtractionResult {
    pub anchors: Vec<ExtractedAnchor>,
    /// txids of transactions with no qualifying anchor output and an input
    /// count within `max_transaction_input_count`, candidates for the fee
    /// reservoir sample.
    pub sampling_candidates: Vec<String>,
}

/// Decodes a bitcoind-style `scriptPubKey.asm` string of the shape
/// `"OP_RETURN <hex>"` into the raw data bytes. Returns `None` if the
/// script is not an OP_RETURN push or is otherwise malformed.
fn decode_op_return(script_asm: &str) -> Option<Vec<u8>> {
    let mut parts = script_asm.split_whitespace();
    if parts.next()? != "OP_RETURN" {
        return None;
    }
    let hex_data = parts.next()?;
    if parts.next().is_some() {
        // More than one token after OP_RETURN: not a single contiguous
        // data push we recognize.
        return None;
    }
    hex::decode(hex_data).ok()
}

/// Extracts anchors and sampling candidates from one block.
///
/// Pure over its inputs: identical `(block, prefix, max_transaction_input_count)`
/// always produces identical output.
pub fn extract(block: &Block, prefix: &[u8], max_transaction_input_count: usize) -> ExtractionResult {
    let mut anchors = Vec::new();
    let mut sampling_candidates = Vec::new();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        match classify(tx, prefix) {
            Classification::Anchor(payload) => {
                anchors.push(ExtractedAnchor {
                    block_height: block.height,
                    index_within_block: tx_index as u32,
                    block_hash: block.hash.clone(),
                    anchor_payload: payload,
                    carrying_txid: tx.txid.clone(),
                });
            }
            Classification::Rejected => {
                warn!(txid = %tx.txid, height = block.height, "skipping transaction with multiple anchor outputs");
                crate::metrics::TRANSACTIONS_REJECTED.inc();
            }
            Classification::Plain => {
                if tx.inputs.len() <= max_transaction_input_count {
                    sampling_candidates.push(tx.txid.clone());
                }
            }
        }
    }

    ExtractionResult { anchors, sampling_candidates }
}

enum Classification {
    Anchor(Vec<u8>),
    Rejected,
    Plain,
}

fn classify(tx: &Transaction, prefix: &[u8]) -> Classification {
    let mut matches: Vec<Vec<u8>> = Vec::new();
    for output in &tx.outputs {
        if let Some(data) = decode_op_return(&output.script_asm) {
            if data.starts_with(prefix) {
                matches.push(data[prefix.len()..].to_vec());
            }
        }
    }
    match matches.len() {
        0 => Classification::Plain,
        1 => Classification::Anchor(matches.into_iter().next().unwrap()),
        _ => Classification::Rejected,
    }
}
