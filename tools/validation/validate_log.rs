//! Validation tool: verify the anchor log's and quantile window's invariants
//! hold against the live node (monotonic transaction numbers, one hash per
//! height, persisted heights not since reorganized, contiguous quantile
//! batches).

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rocksdb::{Options, DB};

use sidetree_anchor::blockchain_client::{BitcoinRpcBlockchainClient, BlockchainClient};
use sidetree_anchor::quantile_calculator::QuantileCalculator;
use sidetree_anchor::transaction_log::TransactionLog;

#[derive(Parser, Debug)]
#[clap(name = "validate-log")]
#[clap(about = "Verify the anchor log and quantile window invariants against a live node", long_about = None)]
struct Args {
    #[clap(long)]
    db_path: String,

    #[clap(long)]
    rpc_url: String,
    #[clap(long)]
    rpc_user: String,
    #[clap(long)]
    rpc_password: String,

    #[clap(long, default_value_t = 5000)]
    request_timeout_ms: u64,
    #[clap(long, default_value_t = 3)]
    request_max_retries: u32,

    #[clap(long, default_value_t = 1)]
    fee_approximation: u64,
    #[clap(long, default_value_t = 4)]
    window_size_in_batches: usize,
    #[clap(long, default_value_t = 0.5)]
    quantile: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let opts = Options::default();
    let db = Arc::new(DB::open_cf_for_read_only(
        &opts,
        &args.db_path,
        vec!["transactions", "quantile_snapshots", "engine_state"],
        false,
    )?);

    let client = BitcoinRpcBlockchainClient::new(
        args.rpc_url,
        args.rpc_user,
        args.rpc_password,
        Duration::from_millis(args.request_timeout_ms),
        args.request_max_retries,
    );

    let mut violations = Vec::new();

    let log = TransactionLog::open(Arc::clone(&db))?;
    let records = log.later_than(None, usize::MAX)?;
    println!("checking {} log records...", records.len());

    let mut previous: Option<&sidetree_anchor::types::AnchorRecord> = None;
    let mut height_hashes: std::collections::HashMap<u32, String> = std::collections::HashMap::new();

    for record in &records {
        // Property 1: strictly increasing transaction_number implies
        // strictly increasing (height, index).
        if let Some(prev) = previous {
            if record.transaction_number <= prev.transaction_number {
                violations.push(format!(
                    "non-monotonic transaction_number: {} then {}",
                    prev.transaction_number, record.transaction_number
                ));
            } else if record.block_height < prev.block_height
                || (record.block_height == prev.block_height && record.index_within_block() <= prev.index_within_block())
            {
                violations.push(format!(
                    "transaction_number order disagrees with (height, index) at {}",
                    record.transaction_number
                ));
            }
        }

        // Property 2: records at the same height share one hash.
        match height_hashes.get(&record.block_height) {
            Some(existing) if existing != &record.block_hash => {
                violations.push(format!(
                    "height {} has two different hashes in the log: {} and {}",
                    record.block_height, existing, record.block_hash
                ));
            }
            _ => {
                height_hashes.insert(record.block_height, record.block_hash.clone());
            }
        }

        previous = Some(record);
    }

    // Property 3: every persisted record's hash still matches upstream.
    for (height, expected_hash) in &height_hashes {
        match client.block_hash(*height).await {
            Ok(upstream_hash) if &upstream_hash != expected_hash => {
                violations.push(format!(
                    "height {height} has been reorganized: log has {expected_hash}, upstream has {upstream_hash}"
                ));
            }
            Ok(_) => {}
            Err(e) => violations.push(format!("could not fetch upstream hash for height {height}: {e}")),
        }
    }

    let quantile =
        QuantileCalculator::open(Arc::clone(&db), args.fee_approximation, args.window_size_in_batches, args.quantile)?;
    let batch_ids: Vec<u64> = quantile.snapshots().map(|s| s.batch_id).collect();
    println!("checking {} quantile batches for contiguity...", batch_ids.len());

    // Property 5: contiguous batch-id sequence, length <= window_size.
    if batch_ids.len() > args.window_size_in_batches {
        violations.push(format!(
            "quantile window has {} batches, exceeding window_size_in_batches {}",
            batch_ids.len(),
            args.window_size_in_batches
        ));
    }
    for pair in batch_ids.windows(2) {
        if pair[1] != pair[0] + 1 {
            violations.push(format!("quantile window is not contiguous: batch {} followed by batch {}", pair[0], pair[1]));
        }
    }

    if violations.is_empty() {
        println!("OK: no invariant violations found");
        Ok(())
    } else {
        for v in &violations {
            eprintln!("VIOLATION: {v}");
        }
        Err(format!("{} invariant violation(s) found", violations.len()).into())
    }
}
