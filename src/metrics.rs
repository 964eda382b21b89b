//! Prometheus instrumentation for the sync engine.
//!
//! A `Registry` plus `lazy_static!` metric statics, thin `record_*` helper
//! functions, and a `gather_metrics` exposition function for the HTTP
//! `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const TICK_DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref UPSTREAM_TIP_HEIGHT: IntGauge = IntGauge::new(
        "sidetree_upstream_tip_height", "Most recently observed upstream chain tip height"
    ).unwrap();

    pub static ref LAST_SEEN_BLOCK_HEIGHT: IntGauge = IntGauge::new(
        "sidetree_last_seen_block_height", "Height of the last block the engine has fully processed"
    ).unwrap();

    pub static ref TRANSACTION_LOG_LENGTH: IntGauge = IntGauge::new(
        "sidetree_transaction_log_length", "Number of anchor records currently persisted"
    ).unwrap();

    pub static ref QUANTILE_WINDOW_LENGTH: IntGauge = IntGauge::new(
        "sidetree_quantile_window_length", "Number of batch snapshots currently in the sliding window"
    ).unwrap();

    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "sidetree_blocks_processed_total", "Blocks successfully processed by the sync engine"
    ).unwrap();

    pub static ref ANCHORS_DISCOVERED: IntCounter = IntCounter::new(
        "sidetree_anchors_discovered_total", "Anchor records appended to the transaction log"
    ).unwrap();

    pub static ref TRANSACTIONS_REJECTED: IntCounter = IntCounter::new(
        "sidetree_transactions_rejected_total", "Transactions skipped for carrying more than one anchor output"
    ).unwrap();

    pub static ref ROLLBACK_EVENTS: IntCounter = IntCounter::new(
        "sidetree_rollback_events_total", "Number of times the engine entered Reverting"
    ).unwrap();

    pub static ref ROLLBACK_DEPTH_BLOCKS: IntGauge = IntGauge::new(
        "sidetree_rollback_depth_blocks", "Blocks discarded by the most recent rollback"
    ).unwrap();

    pub static ref UPSTREAM_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("sidetree_upstream_errors_total", "Errors returned by BlockchainClient, by kind"),
        &["kind"],
    ).unwrap();

    pub static ref PERSISTENCE_ERRORS: IntCounter = IntCounter::new(
        "sidetree_persistence_errors_total", "Errors returned by the durable store"
    ).unwrap();

    pub static ref TICK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("sidetree_tick_duration_seconds", "Wall-clock time of one sync engine tick")
            .buckets(TICK_DURATION_BUCKETS.to_vec()),
        &["outcome"],
    ).unwrap();

    pub static ref HALTED: IntGauge = IntGauge::new(
        "sidetree_halted", "1 if the engine has entered Halted and requires external restart, else 0"
    ).unwrap();
}

/// Registers every metric above into [`REGISTRY`]. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(UPSTREAM_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(LAST_SEEN_BLOCK_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(TRANSACTION_LOG_LENGTH.clone()))?;
    REGISTRY.register(Box::new(QUANTILE_WINDOW_LENGTH.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(ANCHORS_DISCOVERED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_REJECTED.clone()))?;
    REGISTRY.register(Box::new(ROLLBACK_EVENTS.clone()))?;
    REGISTRY.register(Box::new(ROLLBACK_DEPTH_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(UPSTREAM_ERRORS.clone()))?;
    REGISTRY.register(Box::new(PERSISTENCE_ERRORS.clone()))?;
    REGISTRY.register(Box::new(TICK_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(HALTED.clone()))?;
    Ok(())
}

/// Renders the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// A tiny wall-clock stopwatch, used to time one sync engine tick before
/// recording it into [`TICK_DURATION_SECONDS`].
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self { start: std::time::Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_tick(outcome: &str, timer: &Timer) {
    TICK_DURATION_SECONDS.with_label_values(&[outcome]).observe(timer.elapsed_secs());
}

pub fn record_rollback(depth_blocks: i64) {
    ROLLBACK_EVENTS.inc();
    ROLLBACK_DEPTH_BLOCKS.set(depth_blocks);
}
