use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use sidetree_anchor::blockchain_client::{BitcoinRpcBlockchainClient, BlockchainClient};
use sidetree_anchor::config::{get_global_config, init_global_config};
use sidetree_anchor::error::EngineError;
use sidetree_anchor::http_api;
use sidetree_anchor::metrics;
use sidetree_anchor::query_api::{QueryApi, QueryApiConfig};
use sidetree_anchor::sync_engine::{SyncEngine, SyncEngineConfig};
use sidetree_anchor::telemetry::{self, TelemetryConfig};
use tracing::{error, info};

const COLUMN_FAMILIES: [&str; 3] = ["transactions", "quantile_snapshots", "engine_state"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing(TelemetryConfig::default())?;
    metrics::init_metrics()?;

    init_global_config()?;
    let config = get_global_config();

    let mut db_options = Options::default();
    db_options.create_if_missing(true);
    db_options.create_missing_column_families(true);
    db_options.set_compression_type(rocksdb::DBCompressionType::Lz4);

    let cf_descriptors = COLUMN_FAMILIES
        .iter()
        .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()))
        .collect::<Vec<_>>();
    let db = Arc::new(DB::open_cf_descriptors(&db_options, &config.db_path, cf_descriptors)?);

    let client = Arc::new(BitcoinRpcBlockchainClient::new(
        config.rpc_url.clone(),
        config.rpc_user.clone(),
        config.rpc_password.clone(),
        Duration::from_millis(config.request_timeout_ms),
        config.request_max_retries,
    ));

    let prefix = config.sidetree_transaction_prefix_bytes()?;
    let pof = &config.proof_of_fee;
    let fee_cfg = &pof.transaction_fee_quantile_config;

    let engine_config = SyncEngineConfig {
        prefix: prefix.clone(),
        genesis_block_number: config.genesis_block_number,
        max_transaction_input_count: config.max_transaction_input_count,
        batch_size_in_blocks: fee_cfg.batch_size_in_blocks,
        sample_size: fee_cfg.sample_size,
        window_size_in_batches: fee_cfg.window_size_in_batches,
        quantile: fee_cfg.quantile,
        fee_approximation: fee_cfg.fee_approximation,
    };
    let mut engine = SyncEngine::open(Arc::clone(&client) as Arc<dyn BlockchainClient>, Arc::clone(&db), engine_config)?;

    let query_config = QueryApiConfig {
        page_size: config.transaction_fetch_page_size,
        genesis_block_number: config.genesis_block_number,
        historical_offset_in_blocks: pof.historical_offset_in_blocks,
        quantile_scale: pof.quantile_scale,
        batch_size_in_blocks: fee_cfg.batch_size_in_blocks,
        window_size_in_batches: fee_cfg.window_size_in_batches,
        quantile: fee_cfg.quantile,
        fee_approximation: fee_cfg.fee_approximation,
    };
    let query_api = Arc::new(QueryApi::new(Arc::clone(&client) as Arc<dyn BlockchainClient>, Arc::clone(&db), query_config));

    let http_bind_address = config.http_bind_address.clone();
    tokio::spawn(async move {
        let app = http_api::router(query_api);
        let addr: SocketAddr = http_bind_address.parse().expect("invalid http_bind_address");
        let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind http listener");
        info!(%addr, "query API listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server exited");
        }
    });

    let poll_period = Duration::from_secs(config.transaction_poll_period_seconds);
    loop {
        if let Err(e) = engine.tick().await {
            error!(error = %e, "tick failed");
            // Every per-block/per-tick error (including UpstreamMalformed,
            // which is only fatal for the block that produced it) aborts
            // this tick without advancing last_seen_block and is retried on
            // the next one. The only error that should bring the process
            // down is `Invariant` — a programmer-bug class that also covers
            // an engine that has entered `Halted` after a failed rollback
            // (tick() itself returns `Invariant` in that state) and
            // genuinely requires external restart.
            if matches!(e, EngineError::Invariant(_)) {
                return Err(e.into());
            }
        }
        tokio::time::sleep(poll_period).await;
    }
}
