//! Diagnostic tool: dump the transaction log and quantile snapshots for
//! inspection.

use std::sync::Arc;

use clap::Parser;
use rocksdb::{Options, DB};

use sidetree_anchor::quantile_calculator::QuantileCalculator;
use sidetree_anchor::transaction_log::TransactionLog;

#[derive(Parser, Debug)]
#[clap(name = "inspect-log")]
#[clap(about = "Dump the anchor transaction log and quantile snapshots", long_about = None)]
struct Args {
    #[clap(long)]
    db_path: String,

    #[clap(long, default_value_t = 50)]
    limit: usize,

    #[clap(long, default_value_t = 1)]
    fee_approximation: u64,

    #[clap(long, default_value_t = 4)]
    window_size_in_batches: usize,

    #[clap(long, default_value_t = 0.5)]
    quantile: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let opts = Options::default();
    let db = Arc::new(DB::open_cf_for_read_only(
        &opts,
        &args.db_path,
        vec!["transactions", "quantile_snapshots", "engine_state"],
        false,
    )?);

    let log = TransactionLog::open(Arc::clone(&db))?;
    println!("transaction log: {} records", log.count()?);
    for record in log.later_than(None, args.limit)? {
        println!(
            "  txnum={:>14} height={:>8} index={:>6} hash={} fee={} payload={}",
            record.transaction_number,
            record.block_height,
            record.index_within_block(),
            record.block_hash,
            record.fee_paid,
            hex::encode(&record.anchor_payload),
        );
    }

    let quantile = QuantileCalculator::open(
        Arc::clone(&db),
        args.fee_approximation,
        args.window_size_in_batches,
        args.quantile,
    )?;
    println!("\nquantile window: {} batches", quantile.window_len());
    for snapshot in quantile.snapshots() {
        println!("  batch={:>8} quantile_value_satoshis={}", snapshot.batch_id, snapshot.quantile_value_satoshis);
    }

    let last_seen = sidetree_anchor::engine_state::load(&db)?;
    println!("\nlast_seen_block: {last_seen:?}");

    Ok(())
}
