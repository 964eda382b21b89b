//! The read surface over the transaction log and quantile window. Each call
//! opens a fresh, cheap view of the relevant column families against the
//! shared `Arc<DB>` rather than sharing the
//! [`crate::sync_engine::SyncEngine`]'s in-memory state, so concurrent
//! readers always see whatever the engine has most recently committed.

use std::sync::Arc;

use rocksdb::DB;
use serde::Serialize;

use crate::blockchain_client::BlockchainClient;
use crate::error::{EngineError, EngineResult};
use crate::quantile_calculator::QuantileCalculator;
use crate::transaction_log::TransactionLog;
use crate::types::{batch_id_of, block_of, AnchorRecord};

pub struct QueryApiConfig {
    pub page_size: usize,
    pub genesis_block_number: u32,
    pub historical_offset_in_blocks: u32,
    pub quantile_scale: f64,
    pub batch_size_in_blocks: u32,
    pub window_size_in_batches: usize,
    pub quantile: f64,
    pub fee_approximation: u64,
}

pub struct QueryApi {
    client: Arc<dyn BlockchainClient>,
    db: Arc<DB>,
    config: QueryApiConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeResult {
    pub height: u32,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionsResult {
    pub records: Vec<AnchorRecord>,
    pub more: bool,
}

impl QueryApi {
    pub fn new(client: Arc<dyn BlockchainClient>, db: Arc<DB>, config: QueryApiConfig) -> Self {
        Self { client, db, config }
    }

    /// `time(hash?) -> (height, hash)`. With no hash, the current upstream
    /// tip. With a hash, the height that hash still resolves to upstream —
    /// found by walking back from the tip, since `BlockchainClient` exposes
    /// no reverse hash-to-height lookup (this is a rarely-called
    /// validation path, not the sync hot loop; see DESIGN.md).
    pub async fn time(&self, hash: Option<String>) -> EngineResult<TimeResult> {
        let tip = self.client.tip_height().await?;
        let hash = match hash {
            None => return Ok(TimeResult { height: tip, hash: self.client.block_hash(tip).await? }),
            Some(h) => h,
        };

        let mut height = tip;
        loop {
            let candidate = self.client.block_hash(height).await?;
            if candidate == hash {
                return Ok(TimeResult { height, hash });
            }
            if height == self.config.genesis_block_number {
                return Err(EngineError::BadRequest(format!("hash {hash} not found on the active chain")));
            }
            height -= 1;
        }
    }

    /// `transactions(since?, hash?) -> { records, more }`.
    pub async fn transactions(&self, since: Option<u64>, hash: Option<String>) -> EngineResult<TransactionsResult> {
        match (&since, &hash) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(EngineError::BadRequest("since and hash must both be set or both be absent".into()));
            }
            (Some(since), Some(hash)) => {
                let height = block_of(*since);
                let upstream_hash = self.client.block_hash(height).await?;
                if upstream_hash != *hash {
                    return Err(EngineError::BadRequest(format!(
                        "caller's view of block {height} ({hash}) does not match upstream ({upstream_hash})"
                    )));
                }
            }
            (None, None) => {}
        }

        let log = TransactionLog::open(Arc::clone(&self.db))?;
        let records = log.later_than(since, self.config.page_size)?;
        let more = records.len() == self.config.page_size;
        Ok(TransactionsResult { records, more })
    }

    /// `first_valid_transaction(list)`: the first record whose
    /// `(height, hash)` still matches upstream, or `None` if no record in
    /// the list does.
    pub async fn first_valid_transaction(&self, candidates: &[AnchorRecord]) -> EngineResult<Option<AnchorRecord>> {
        for record in candidates {
            let upstream_hash = self.client.block_hash(record.block_height).await?;
            if upstream_hash == record.block_hash {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    /// `fee(block) -> Option<u64>`, the offset-adjusted, scaled quantile.
    /// Uses its own `batch_id` derivation (block height minus the
    /// historical offset) rather than [`QuantileCalculator::add`]'s raw
    /// height-based one; see DESIGN.md.
    pub fn fee(&self, block: u32) -> EngineResult<Option<u64>> {
        let adjusted = block.saturating_sub(self.config.historical_offset_in_blocks);
        let batch_id = batch_id_of(adjusted, self.config.batch_size_in_blocks);

        let quantile = QuantileCalculator::open(
            Arc::clone(&self.db),
            self.config.fee_approximation,
            self.config.window_size_in_batches,
            self.config.quantile,
        )?;
        // Scale multiplication is the one non-integer operation in the
        // whole pipeline; it is applied once here at the read boundary,
        // never stored, and rounded exactly once (DESIGN.md).
        Ok(quantile
            .quantile(batch_id)
            .map(|q| (q as f64 * self.config.quantile_scale).round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain_client::{Block, InMemoryBlockchainClient};
    use crate::types::construct_transaction_number;
    use rocksdb::{ColumnFamilyDescriptor, Options};
    use tempfile::TempDir;

    fn open_test_db() -> (TempDir, Arc<DB>) {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new("transactions", Options::default()),
            ColumnFamilyDescriptor::new("quantile_snapshots", Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap();
        (dir, Arc::new(db))
    }

    fn default_config() -> QueryApiConfig {
        QueryApiConfig {
            page_size: 2,
            genesis_block_number: 0,
            historical_offset_in_blocks: 0,
            quantile_scale: 1.0,
            batch_size_in_blocks: 4,
            window_size_in_batches: 2,
            quantile: 0.5,
            fee_approximation: 1,
        }
    }

    fn block(height: u32, hash: &str) -> Block {
        Block { height, hash: hash.to_string(), transactions: vec![] }
    }

    #[tokio::test]
    async fn time_with_no_hash_returns_tip() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1")]));
        let api = QueryApi::new(client, db, default_config());
        let t = api.time(None).await.unwrap();
        assert_eq!(t.height, 1);
        assert_eq!(t.hash, "h1");
    }

    #[tokio::test]
    async fn time_with_hash_resolves_its_height() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1"), block(2, "h2")]));
        let api = QueryApi::new(client, db, default_config());
        let t = api.time(Some("h1".to_string())).await.unwrap();
        assert_eq!(t.height, 1);
    }

    #[tokio::test]
    async fn time_with_unknown_hash_is_bad_request() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0")]));
        let api = QueryApi::new(client, db, default_config());
        let err = api.time(Some("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn transactions_rejects_one_sided_since_and_hash() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0")]));
        let api = QueryApi::new(client, db, default_config());
        let err = api.transactions(Some(1), None).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn transactions_rejects_stale_fork_view() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1")]));
        let api = QueryApi::new(client, db, default_config());
        let since = construct_transaction_number(1, 0);
        let err = api.transactions(Some(since), Some("wrong-hash".to_string())).await.unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
    }

    #[tokio::test]
    async fn pagination_reports_more_when_a_full_page_is_returned_scenario_f() {
        let (_dir, db) = open_test_db();
        {
            let mut log = TransactionLog::open(Arc::clone(&db)).unwrap();
            for h in 0..5u32 {
                log.append(AnchorRecord::new(h, 0, format!("h{h}"), vec![h as u8], 1)).unwrap();
            }
        }
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0")]));
        let api = QueryApi::new(client, db, default_config());

        let page1 = api.transactions(None, None).await.unwrap();
        assert_eq!(page1.records.len(), 2);
        assert!(page1.more);

        let r2 = &page1.records[1];
        let page2 = api
            .transactions(Some(r2.transaction_number), Some(r2.block_hash.clone()))
            .await
            .unwrap();
        assert_eq!(page2.records.len(), 2);
        assert!(page2.more);

        let r4 = &page2.records[1];
        let page3 = api
            .transactions(Some(r4.transaction_number), Some(r4.block_hash.clone()))
            .await
            .unwrap();
        assert_eq!(page3.records.len(), 1);
        assert!(!page3.more);
    }

    #[tokio::test]
    async fn first_valid_transaction_skips_stale_records() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1-new")]));
        let api = QueryApi::new(client, db, default_config());
        let stale = AnchorRecord::new(1, 0, "h1-old".into(), vec![1], 1);
        let good = AnchorRecord::new(0, 0, "h0".into(), vec![0], 1);
        let found = api.first_valid_transaction(&[stale, good.clone()]).await.unwrap();
        assert_eq!(found, Some(good));
    }

    #[tokio::test]
    async fn first_valid_transaction_returns_none_when_all_stale() {
        let (_dir, db) = open_test_db();
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0")]));
        let api = QueryApi::new(client, db, default_config());
        let stale = AnchorRecord::new(0, 0, "wrong".into(), vec![1], 1);
        assert_eq!(api.first_valid_transaction(&[stale]).await.unwrap(), None);
    }

    #[test]
    fn fee_reflects_the_offset_adjusted_batch_and_scale() {
        let (_dir, db) = open_test_db();
        {
            let mut quantile = QuantileCalculator::open(Arc::clone(&db), 1, 2, 0.5).unwrap();
            quantile.add(0, &[10, 20, 30]).unwrap();
        }
        let client = Arc::new(InMemoryBlockchainClient::new(vec![block(0, "h0")]));
        let mut config = default_config();
        config.quantile_scale = 10.0;
        let api = QueryApi::new(client, db, config);

        // block 2 is in batch 0 (batch_size_in_blocks = 4, no offset).
        assert_eq!(api.fee(2).unwrap(), Some(200));
        // block 40 falls in an unobserved batch.
        assert_eq!(api.fee(40).unwrap(), None);
    }
}
