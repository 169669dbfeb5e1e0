//! Read-only HTTP API for swap status and server identity

use crate::bridge::BridgePair;
use crate::config::{ApiConfig, TokenConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::store::{Direction, SwapStore};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SwapStore>,
    pub bridges: BridgePair,
    pub identifier: String,
    pub src_token: TokenConfig,
    pub dest_token: TokenConfig,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> BridgeResult<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/serverinfo", get(server_info))
        .route("/stats", get(get_stats))
        .route("/swapin/:txid", get(swapin_status))
        .route("/swapout/:txid", get(swapout_status))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Server identity and the token pair it bridges
async fn server_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(ServerInfoResponse {
        identifier: state.identifier.clone(),
        src_token: state.src_token.clone(),
        dest_token: state.dest_token.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Aggregate swap counts
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn swapin_status(
    State(state): State<AppState>,
    Path(txid): Path<String>,
) -> Result<Json<SwapInfoResponse>, StatusCode> {
    swap_status(state, Direction::Swapin, txid).await
}

async fn swapout_status(
    State(state): State<AppState>,
    Path(txid): Path<String>,
) -> Result<Json<SwapInfoResponse>, StatusCode> {
    swap_status(state, Direction::Swapout, txid).await
}

/// Projection of a swap and its result, with a live confirmation count
/// for the mirror transaction derived from the cached latest height.
async fn swap_status(
    state: AppState,
    direction: Direction,
    txid: String,
) -> Result<Json<SwapInfoResponse>, StatusCode> {
    let swap = state
        .store
        .get_swap(&txid, direction)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let result = state
        .store
        .get_swap_result(&txid, direction)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut response = SwapInfoResponse {
        txid: swap.tx_id,
        from: swap.from,
        bind: swap.bind,
        value: swap.value.to_string(),
        swap_tx: String::new(),
        swap_height: 0,
        swap_time: 0,
        swap_value: String::new(),
        swap_type: None,
        status: swap.status.as_str(),
        timestamp: swap.updated_at,
        memo: swap.memo,
        confirmations: 0,
    };

    if let Some(result) = result {
        if result.swap_height > 0 {
            let latest = state.bridges.emitter(direction).latest_cached_block();
            response.confirmations = latest.saturating_sub(result.swap_height);
        }
        response.swap_tx = result.swap_tx;
        response.swap_height = result.swap_height;
        response.swap_time = result.swap_time;
        response.swap_value = result.swap_value.to_string();
        response.swap_type = Some(result.swap_type.as_str());
    }

    Ok(Json(response))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    identifier: String,
    src_token: TokenConfig,
    dest_token: TokenConfig,
    version: String,
}

#[derive(Serialize)]
struct SwapInfoResponse {
    txid: String,
    from: String,
    bind: String,
    value: String,
    swap_tx: String,
    swap_height: u64,
    swap_time: u64,
    swap_value: String,
    swap_type: Option<&'static str>,
    status: &'static str,
    timestamp: i64,
    memo: Option<String>,
    confirmations: u64,
}
