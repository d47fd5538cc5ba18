// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The chart and indicator endpoints are
// read-only views of the coordinator; the subscription endpoints switch or
// retry the live chart.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::coordinator::{Coordinator, FeedStatus, SelectOutcome};
use crate::error::CoordinatorError;
use crate::indicators::IndicatorOutput;
use crate::market_data::history::HistoryFetcher;
use crate::market_data::transport::Connector;
use crate::types::{SubscriptionKey, Timeframe};

type Feed<H, C> = State<Arc<Coordinator<H, C>>>;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST API router with CORS middleware and the coordinator as
/// shared state.
pub fn router<H: HistoryFetcher, C: Connector>(coordinator: Arc<Coordinator<H, C>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Read-only ───────────────────────────────────────────────
        .route("/api/v1/health", get(health::<H, C>))
        .route("/api/v1/chart", get(chart::<H, C>))
        .route("/api/v1/indicators/:config", get(indicator::<H, C>))
        // ── Control ─────────────────────────────────────────────────
        .route("/api/v1/subscription", put(select::<H, C>))
        .route("/api/v1/subscription/retry", post(retry::<H, C>))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(coordinator)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    feed: FeedStatus,
    subscription: Option<String>,
    server_time: i64,
}

async fn health<H: HistoryFetcher, C: Connector>(State(feed): Feed<H, C>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        feed: feed.status().borrow().clone(),
        subscription: feed.current_key().map(|k| k.to_string()),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Chart & indicators
// =============================================================================

#[derive(Deserialize)]
struct ChartQuery {
    /// Only return the newest `limit` candles.
    #[serde(default)]
    limit: Option<usize>,
}

async fn chart<H: HistoryFetcher, C: Connector>(
    State(feed): Feed<H, C>,
    Query(query): Query<ChartQuery>,
) -> impl IntoResponse {
    let mut snapshot = feed.snapshot();
    if let Some(limit) = query.limit {
        let excess = snapshot.candles.len().saturating_sub(limit);
        snapshot.candles.drain(..excess);
    }
    Json(snapshot)
}

#[derive(Serialize)]
struct IndicatorResponse<'a> {
    indicator: String,
    output: &'a IndicatorOutput,
}

async fn indicator<H: HistoryFetcher, C: Connector>(
    State(feed): Feed<H, C>,
    Path(config): Path<String>,
) -> Response {
    match feed.indicator_str(&config) {
        Ok(output) => Json(IndicatorResponse {
            indicator: config,
            output: &output,
        })
        .into_response(),
        Err(e) => {
            warn!(config = %config, error = %e, "rejected indicator request");
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

// =============================================================================
// Subscription control
// =============================================================================

#[derive(Deserialize)]
struct SubscriptionRequest {
    symbol: String,
    timeframe: Timeframe,
}

#[derive(Serialize)]
struct SubscriptionResponse {
    outcome: &'static str,
    subscription: Option<String>,
    candles: Option<usize>,
}

async fn select<H: HistoryFetcher, C: Connector>(
    State(feed): Feed<H, C>,
    Json(req): Json<SubscriptionRequest>,
) -> Response {
    let key = SubscriptionKey::new(&req.symbol, req.timeframe);
    info!(key = %key, "subscription change via API");
    outcome_response(&feed, feed.select(key).await)
}

async fn retry<H: HistoryFetcher, C: Connector>(State(feed): Feed<H, C>) -> Response {
    info!("subscription retry via API");
    outcome_response(&feed, feed.retry().await)
}

fn outcome_response<H: HistoryFetcher, C: Connector>(
    feed: &Coordinator<H, C>,
    result: Result<SelectOutcome, CoordinatorError>,
) -> Response {
    let subscription = feed.current_key().map(|k| k.to_string());
    match result {
        Ok(SelectOutcome::Applied { candles }) => Json(SubscriptionResponse {
            outcome: "applied",
            subscription,
            candles: Some(candles),
        })
        .into_response(),
        Ok(SelectOutcome::Superseded) => (
            StatusCode::CONFLICT,
            Json(SubscriptionResponse {
                outcome: "superseded",
                subscription,
                candles: None,
            }),
        )
            .into_response(),
        Err(e) => {
            let status = match e {
                CoordinatorError::InvalidSymbol(_) => StatusCode::BAD_REQUEST,
                CoordinatorError::NoSubscription => StatusCode::CONFLICT,
                CoordinatorError::Backfill { .. } => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %e, "subscription request failed");
            error_body(status, e.to_string())
        }
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
