//! Thin HTTP facade over [`crate::query_api::QueryApi`].
//!
//! Intentionally minimal: no auth, no OpenAPI, no write-path endpoints, just
//! a `Router` with `Extension<Arc<QueryApi>>` state and handlers returning
//! `Result<Json<T>, (StatusCode, Json<ErrorBody>)>`.

use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::error::EngineError;
use crate::query_api::QueryApi;
use crate::types::AnchorRecord;

pub fn router(query_api: Arc<QueryApi>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/time", get(time_handler))
        .route("/transactions", get(transactions_handler))
        .route("/fee/{block}", get(fee_handler))
        .route("/metrics", get(metrics_handler))
        .layer(Extension(query_api))
        .layer(cors)
}

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: u16,
    code: &'static str,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn error_response(err: EngineError) -> (StatusCode, Json<ErrorBody>) {
    let (status, code) = match err {
        EngineError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
        EngineError::UpstreamTimeout(_) | EngineError::UpstreamError(_) | EngineError::PersistenceError(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "ServerError")
        }
        EngineError::UpstreamMalformed(_) | EngineError::Invariant(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ServerError"),
    };
    (status, Json(ErrorBody { status: status.as_u16(), code }))
}

#[derive(Debug, Deserialize)]
struct TimeQuery {
    hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct TimeResponse {
    time: u32,
    hash: String,
}

async fn time_handler(Extension(api): Extension<Arc<QueryApi>>, Query(q): Query<TimeQuery>) -> ApiResult<TimeResponse> {
    let result = api.time(q.hash).await.map_err(error_response)?;
    Ok(Json(TimeResponse { time: result.height, hash: result.hash }))
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    since: Option<u64>,
    hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransactionEntry {
    #[serde(rename = "transactionNumber")]
    transaction_number: u64,
    #[serde(rename = "transactionTime")]
    transaction_time: u32,
    #[serde(rename = "transactionTimeHash")]
    transaction_time_hash: String,
    #[serde(rename = "anchorString")]
    anchor_string: String,
    #[serde(rename = "feePaid")]
    fee_paid: u64,
}

impl From<AnchorRecord> for TransactionEntry {
    fn from(r: AnchorRecord) -> Self {
        Self {
            transaction_number: r.transaction_number,
            transaction_time: r.block_height,
            transaction_time_hash: r.block_hash,
            anchor_string: String::from_utf8_lossy(&r.anchor_payload).into_owned(),
            fee_paid: r.fee_paid,
        }
    }
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    #[serde(rename = "moreTransactions")]
    more_transactions: bool,
    transactions: Vec<TransactionEntry>,
}

async fn transactions_handler(
    Extension(api): Extension<Arc<QueryApi>>,
    Query(q): Query<TransactionsQuery>,
) -> ApiResult<TransactionsResponse> {
    let result = api.transactions(q.since, q.hash).await.map_err(error_response)?;
    Ok(Json(TransactionsResponse {
        more_transactions: result.more,
        transactions: result.records.into_iter().map(TransactionEntry::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct FeeResponse {
    #[serde(rename = "normalizedTransactionFee")]
    normalized_transaction_fee: u64,
}

async fn fee_handler(Extension(api): Extension<Arc<QueryApi>>, axum::extract::Path(block): axum::extract::Path<u32>) -> ApiResult<FeeResponse> {
    let fee = api.fee(block).map_err(error_response)?;
    match fee {
        Some(normalized_transaction_fee) => Ok(Json(FeeResponse { normalized_transaction_fee })),
        None => Err((StatusCode::NOT_FOUND, Json(ErrorBody { status: 404, code: "NotFound" }))),
    }
}
