//! Transaction fee computation for anchors and fee samples.
//!
//! `fee = sum(inputs.prev_output.value) - sum(outputs.value)`, in satoshis.
//! Computing the value of each input requires one `raw_transaction` lookup
//! per input (to find the prevout's value); any failing lookup fails the
//! whole fee computation for that transaction, so a bad transaction is
//! skipped rather than allowed to corrupt state.

use crate::blockchain_client::{BlockchainClient, Transaction};
use crate::error::EngineResult;

/// Computes the fee (in satoshis) paid by `tx`, fetching each input's
/// previous output via `client.raw_transaction`.
pub async fn compute_fee(client: &dyn BlockchainClient, tx: &Transaction) -> EngineResult<u64> {
    let mut value_in: u64 = 0;
    for input in &tx.inputs {
        let prev = client.raw_transaction(&input.prev_txid).await?;
        let prev_out = prev.outputs.get(input.prev_vout as usize).ok_or_else(|| {
            crate::error::EngineError::UpstreamMalformed(format!(
                "prev_txid {} has no output at index {}",
                input.prev_txid, input.prev_vout
            ))
        })?;
        value_in += prev_out.value_satoshis;
    }
    let value_out: u64 = tx.outputs.iter().map(|o| o.value_satoshis).sum();
    Ok(value_in.saturating_sub(value_out))
}
