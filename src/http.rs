//! JSON HTTP routes and the WebSocket event feed.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::amm_core::Side;
use crate::market_api::{EngineError, MarketEngine, MarketEvent, NewMarket, RejectReason, TradeRequest};
use crate::store::DocumentStore;

pub type SharedEngine = Arc<MarketEngine<Arc<dyn DocumentStore>>>;

pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/portfolio", get(get_portfolio))
        .route("/markets", get(list_markets).post(create_market))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/quote", get(get_quote))
        .route("/markets/:id/history", get(get_history))
        .route("/markets/:id/trades", post(post_trade))
        .route("/markets/:id/resolve", post(post_resolve))
        .route("/leaderboard", get(get_leaderboard))
        .route("/ws", get(event_feed))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Engine errors mapped onto HTTP status codes.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Rejected(RejectReason::UnknownUser(_) | RejectReason::UnknownMarket(_)) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Rejected(RejectReason::NotCreator) => StatusCode::FORBIDDEN,
            EngineError::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            EngineError::Store(err) => {
                error!("Store error: {}", err);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Internal server error"})),
                )
                    .into_response();
            }
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn to_json<T: serde::Serialize>(value: T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError(EngineError::Store(e.into())))
}

// Health check endpoint
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "market-engine"
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserBody {
    display_name: String,
}

async fn create_user(State(engine): State<SharedEngine>, Json(body): Json<CreateUserBody>) -> ApiResult {
    to_json(engine.create_user(&body.display_name).await?)
}

async fn get_user(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult {
    to_json(engine.user(&id).await?)
}

async fn get_portfolio(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult {
    to_json(engine.portfolio(&id).await?)
}

async fn list_markets(State(engine): State<SharedEngine>) -> ApiResult {
    let markets = engine.list_markets().await?;
    to_json(json!({ "markets": markets }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateMarketBody {
    creator_id: String,
    #[serde(flatten)]
    market: NewMarket,
}

async fn create_market(State(engine): State<SharedEngine>, Json(body): Json<CreateMarketBody>) -> ApiResult {
    to_json(engine.create_market(&body.creator_id, body.market).await?)
}

async fn get_market(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult {
    to_json(engine.market_view(&id).await?)
}

#[derive(Debug, Deserialize)]
struct QuoteParams {
    outcome: usize,
    shares: f64,
}

async fn get_quote(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Query(params): Query<QuoteParams>,
) -> ApiResult {
    to_json(engine.quote(&id, params.outcome, params.shares).await?)
}

async fn get_history(State(engine): State<SharedEngine>, Path(id): Path<String>) -> ApiResult {
    let points = engine.price_history(&id).await?;
    to_json(json!({ "marketId": id, "points": points }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeBody {
    user_id: String,
    outcome_index: usize,
    shares: f64,
    side: Side,
}

async fn post_trade(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(body): Json<TradeBody>,
) -> ApiResult {
    let request = TradeRequest {
        user_id: body.user_id,
        market_id: id,
        outcome_index: body.outcome_index,
        shares: body.shares,
        side: body.side,
    };
    to_json(engine.execute_trade(request).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveBody {
    caller_id: String,
    winning_index: usize,
}

async fn post_resolve(
    State(engine): State<SharedEngine>,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult {
    to_json(engine.resolve_market(&body.caller_id, &id, body.winning_index).await?)
}

#[derive(Debug, Deserialize)]
struct LeaderboardParams {
    limit: Option<usize>,
}

async fn get_leaderboard(
    State(engine): State<SharedEngine>,
    Query(params): Query<LeaderboardParams>,
) -> ApiResult {
    let entries = engine.leaderboard(params.limit).await?;
    to_json(json!({ "leaderboard": entries }))
}

async fn event_feed(State(engine): State<SharedEngine>, ws: WebSocketUpgrade) -> Response {
    // Subscribe before the upgrade so nothing written after the handshake is missed
    let events = engine.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(socket: WebSocket, mut events: broadcast::Receiver<MarketEvent>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode market event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event feed subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
