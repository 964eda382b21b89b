//! Maintenance tool: force a rollback to a given height and let the next
//! `sidetree-anchor` run re-sync forward from there.
//!
//! Unlike [`sidetree_anchor::sync_engine::SyncEngine`]'s own rollback, this
//! does not probe upstream for a surviving height first — it is an operator
//! override for when the engine has already halted (a persistence failure
//! during rollback enters `Halted` and requires external restart, since
//! rollback is not safe to retry mid-flight) or when upstream state is
//! otherwise known to have diverged below `height`.

use std::sync::Arc;

use clap::Parser;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use sidetree_anchor::engine_state;
use sidetree_anchor::quantile_calculator::QuantileCalculator;
use sidetree_anchor::transaction_log::TransactionLog;
use sidetree_anchor::types::batch_id_of;

#[derive(Parser, Debug)]
#[clap(name = "force-rollback")]
#[clap(about = "Force the anchor log and quantile window back to a given block height", long_about = None)]
struct Args {
    #[clap(long)]
    db_path: String,

    /// Every record/snapshot covering this height or later is discarded;
    /// `last_seen_block` is cleared so the engine resumes forward sync from
    /// `height + 1` (or from scratch, if omitted).
    #[clap(long)]
    height: Option<u32>,

    #[clap(long, default_value_t = 1)]
    batch_size_in_blocks: u32,

    #[clap(long, default_value_t = 1)]
    fee_approximation: u64,

    #[clap(long, default_value_t = 4)]
    window_size_in_batches: usize,

    #[clap(long, default_value_t = 0.5)]
    quantile: f64,

    /// Without this flag, the tool only reports what it would do.
    #[clap(long, default_value_t = false)]
    apply: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut opts = Options::default();
    opts.create_if_missing(false);
    let cfs = vec![
        ColumnFamilyDescriptor::new("transactions", Options::default()),
        ColumnFamilyDescriptor::new("quantile_snapshots", Options::default()),
        ColumnFamilyDescriptor::new("engine_state", Options::default()),
    ];
    let db = Arc::new(DB::open_cf_descriptors(&opts, &args.db_path, cfs)?);

    let mut log = TransactionLog::open(Arc::clone(&db))?;
    let mut quantile =
        QuantileCalculator::open(Arc::clone(&db), args.fee_approximation, args.window_size_in_batches, args.quantile)?;

    let before = (log.count()?, quantile.window_len());
    println!("before: {} log records, {} quantile batches", before.0, before.1);

    let Some(height) = args.height else {
        println!("no --height given; nothing to do (pass --height to truncate to a specific block)");
        return Ok(());
    };
    let batch_id = batch_id_of(height, args.batch_size_in_blocks);
    println!("would remove log records at height >= {height} and quantile batches >= {batch_id}");

    if !args.apply {
        println!("dry run; pass --apply to actually rewrite the database");
        return Ok(());
    }

    log.remove_later_than_block(height)?;
    quantile.remove_batches_ge(batch_id)?;
    engine_state::store(&db, None)?;

    println!(
        "after: {} log records, {} quantile batches; last_seen_block cleared",
        log.count()?,
        quantile.window_len()
    );
    Ok(())
}
