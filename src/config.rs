//! Typed configuration, loaded once at startup.
//!
//! A `config.toml` source plus a global `OnceCell<EngineConfig>`, materialized
//! into a typed [`EngineConfig`] via `serde` instead of handing callers a raw
//! untyped `config::Config` to query key by key.

use std::error::Error;

use once_cell::sync::OnceCell;
use serde::Deserialize;

static GLOBAL_CONFIG: OnceCell<EngineConfig> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionFeeQuantileConfig {
    pub batch_size_in_blocks: u32,
    pub window_size_in_batches: usize,
    pub sample_size: usize,
    pub quantile: f64,
    pub fee_approximation: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProofOfFeeConfig {
    pub historical_offset_in_blocks: u32,
    pub quantile_scale: f64,
    pub transaction_fee_quantile_config: TransactionFeeQuantileConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub db_path: String,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,

    pub sidetree_transaction_prefix: String,
    pub genesis_block_number: u32,
    pub transaction_fetch_page_size: usize,
    pub request_timeout_ms: u64,
    pub request_max_retries: u32,
    pub transaction_poll_period_seconds: u64,
    pub max_transaction_input_count: usize,

    pub proof_of_fee: ProofOfFeeConfig,

    #[serde(default = "default_http_bind_address")]
    pub http_bind_address: String,
}

fn default_http_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

impl EngineConfig {
    /// The configured anchor marker as raw bytes. This is the UTF-8 string
    /// configured directly (e.g. `"sidetree:"`), not a hex-encoded value —
    /// an operator writing `sidetree_transaction_prefix = "sidetree:"` in
    /// `config.toml` gets exactly those bytes.
    pub fn sidetree_transaction_prefix_bytes(&self) -> Result<Vec<u8>, Box<dyn Error>> {
        Ok(self.sidetree_transaction_prefix.as_bytes().to_vec())
    }
}

fn build_raw() -> Result<config::Config, Box<dyn Error>> {
    Ok(config::Config::builder()
        .add_source(config::File::with_name("config.toml"))
        .add_source(config::Environment::with_prefix("SIDETREE").separator("__"))
        .build()?)
}

/// Loads `config.toml` (plus `SIDETREE__*` environment overrides) into a
/// typed [`EngineConfig`]. Intended for standalone binaries/utilities that
/// don't want the global-singleton wiring below.
pub fn load_config() -> Result<EngineConfig, Box<dyn Error>> {
    let raw = build_raw()?;
    raw.try_deserialize::<EngineConfig>()
        .map_err(|e| format!("invalid configuration: {e}").into())
}

pub fn init_global_config() -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    GLOBAL_CONFIG.set(config).map_err(|_| "config already initialized")?;
    Ok(())
}

pub fn get_global_config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}
