//! Sidetree anchor / proof-of-fee engine: watches a Bitcoin-family chain for
//! prefixed `OP_RETURN` anchors, keeps a durable, reorg-safe log of them, and
//! maintains a sliding-window fee quantile used to price future anchors.

pub mod anchor_extractor;
pub mod blockchain_client;
pub mod config;
pub mod engine_state;
pub mod error;
pub mod fee;
pub mod http_api;
pub mod metrics;
pub mod quantile_calculator;
pub mod query_api;
pub mod reservoir_sampler;
pub mod sync_engine;
pub mod telemetry;
pub mod transaction_log;
pub mod types;
