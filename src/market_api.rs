//! Market engine API over a document store.
//!
//! Every call re-reads the documents it needs, computes the new state with
//! `amm_core`, and writes the results back. Market documents are written
//! with a revision check so concurrent trades on one market retry against a
//! fresh snapshot instead of silently overwriting each other's pools.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::amm_core::{self, AmmError, AmmParams, Side};
use crate::config::MarketConfig;
use crate::documents::{new_id, DocId, Market, MarketStatus, Position, Trade, User};
use crate::store::{DocumentStore, DocumentStoreExt, StoreError, Stored};

// Configuration constants for concurrency control
const MAX_RETRY_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 10;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why an operation was refused. Refused operations write nothing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("user {0} not found")]
    UnknownUser(DocId),
    #[error("market {0} not found")]
    UnknownMarket(DocId),
    #[error("market {0} is not active")]
    MarketNotActive(DocId),
    #[error("share quantity must be positive, got {0}")]
    NonPositiveShares(f64),
    #[error("outcome {index} out of range for {len} outcomes")]
    OutcomeOutOfRange { index: usize, len: usize },
    #[error("insufficient balance: cost {cost:.4} exceeds balance {balance:.4}")]
    InsufficientBalance { cost: f64, balance: f64 },
    #[error("only the market creator can resolve it")]
    NotCreator,
    #[error("display name must not be blank")]
    BlankDisplayName,
    #[error("question must not be blank")]
    BlankQuestion,
    #[error("a market needs at least two outcomes, got {0}")]
    TooFewOutcomes(usize),
    #[error("market pools cannot be priced")]
    DegeneratePools,
}

impl From<AmmError> for RejectReason {
    fn from(err: AmmError) -> Self {
        match err {
            AmmError::OutcomeOutOfRange { index, len } => RejectReason::OutcomeOutOfRange { index, len },
            AmmError::DegeneratePools => RejectReason::DegeneratePools,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("market {market_id} kept changing, gave up after {attempts} attempts")]
    Conflict { market_id: DocId, attempts: u32 },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Store(err)
    }
}

impl From<AmmError> for EngineError {
    fn from(err: AmmError) -> Self {
        EngineError::Rejected(err.into())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

fn reject<T>(reason: RejectReason) -> EngineResult<T> {
    warn!("operation rejected: {}", reason);
    Err(EngineError::Rejected(reason))
}

/// Retries the body while the market write loses a revision race.
/// Exponential backoff with jitter, same shape as a serialization retry.
macro_rules! with_market_retry {
    ($market_id:expr, $body:block) => {{
        let mut attempt = 1;
        loop {
            let result: EngineResult<_> = async { $body }.await;

            match result {
                Err(EngineError::Store(StoreError::Conflict { .. })) if attempt < MAX_RETRY_ATTEMPTS => {
                    let jitter = rand::thread_rng().gen_range(0..10);
                    let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                    debug!(market_id = %$market_id, attempt, delay_ms, "market revision conflict, retrying");
                    sleep(StdDuration::from_millis(delay_ms)).await;
                    attempt += 1;
                    continue;
                }
                Err(EngineError::Store(StoreError::Conflict { .. })) => {
                    warn!(market_id = %$market_id, attempt, "market revision conflict, giving up");
                    break Err(EngineError::Conflict {
                        market_id: $market_id.to_string(),
                        attempts: attempt,
                    });
                }
                other => break other,
            }
        }
    }};
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MarketEvent {
    #[serde(rename_all = "camelCase")]
    UserCreated { user: User },
    #[serde(rename_all = "camelCase")]
    MarketCreated { market: Market },
    #[serde(rename_all = "camelCase")]
    TradeExecuted { trade: Trade, pools: Vec<f64> },
    #[serde(rename_all = "camelCase")]
    MarketResolved {
        market_id: DocId,
        winning_index: usize,
        payouts: Vec<Payout>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMarket {
    pub question: String,
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub user_id: DocId,
    pub market_id: DocId,
    pub outcome_index: usize,
    pub shares: f64,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeReceipt {
    pub trade: Trade,
    pub market: Market,
    pub balance: f64,
    /// Absent for a sell against an outcome the user never bought.
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Payout {
    pub user_id: DocId,
    pub shares: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionSummary {
    pub market: Market,
    pub total_pool: f64,
    pub payouts: Vec<Payout>,
    pub distributed: f64,
    /// Part of the pool credited to no one.
    pub retained: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    #[serde(flatten)]
    pub market: Market,
    pub prices: Vec<f64>,
}

impl From<Market> for MarketView {
    fn from(market: Market) -> Self {
        let prices = market.prices();
        Self { market, prices }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub market_id: DocId,
    pub outcome_index: usize,
    pub shares: f64,
    pub buy_cost: f64,
    pub sell_refund: f64,
    pub prices: Vec<f64>,
    pub prices_after_buy: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub user_id: DocId,
    pub display_name: String,
    pub balance: f64,
    pub total_value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEntry {
    pub position: Position,
    pub question: String,
    pub outcome: String,
    pub status: MarketStatus,
    pub price: f64,
    pub current_value: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub prices: Vec<f64>,
}

pub struct MarketEngine<S> {
    store: S,
    config: MarketConfig,
    params: AmmParams,
    events: broadcast::Sender<MarketEvent>,
}

impl<S: DocumentStore> MarketEngine<S> {
    pub fn new(store: S, config: MarketConfig) -> Self {
        let params = config.amm_params();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            config,
            params,
            events,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Live feed of engine writes. Slow receivers lag and lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: MarketEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn load_user(&self, user_id: &str) -> EngineResult<Stored<User>> {
        match self.store.get_as::<User>(user_id).await? {
            Some(user) => Ok(user),
            None => reject(RejectReason::UnknownUser(user_id.to_string())),
        }
    }

    async fn load_market(&self, market_id: &str) -> EngineResult<Stored<Market>> {
        match self.store.get_as::<Market>(market_id).await? {
            Some(market) => Ok(market),
            None => reject(RejectReason::UnknownMarket(market_id.to_string())),
        }
    }

    pub async fn create_user(&self, display_name: &str) -> EngineResult<User> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return reject(RejectReason::BlankDisplayName);
        }

        let user = User::new(display_name, self.config.initial_balance);
        self.store.put(user.clone().into()).await?;
        info!(user_id = %user.id, display_name = %user.display_name, "user created");

        self.publish(MarketEvent::UserCreated { user: user.clone() });
        Ok(user)
    }

    pub async fn user(&self, user_id: &str) -> EngineResult<User> {
        Ok(self.load_user(user_id).await?.doc)
    }

    pub async fn create_market(&self, creator_id: &str, new_market: NewMarket) -> EngineResult<Market> {
        let question = new_market.question.trim();
        if question.is_empty() {
            return reject(RejectReason::BlankQuestion);
        }
        let outcomes: Vec<String> = new_market
            .outcomes
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if outcomes.len() < 2 {
            return reject(RejectReason::TooFewOutcomes(outcomes.len()));
        }
        self.load_user(creator_id).await?;

        let market = Market::new(
            question,
            outcomes,
            self.config.initial_pool,
            new_market.deadline,
            creator_id,
        );
        self.store.put(market.clone().into()).await?;
        info!(
            market_id = %market.id,
            creator_id,
            outcomes = market.outcomes.len(),
            "market created"
        );

        self.publish(MarketEvent::MarketCreated { market: market.clone() });
        Ok(market)
    }

    pub async fn market_view(&self, market_id: &str) -> EngineResult<MarketView> {
        Ok(self.load_market(market_id).await?.doc.into())
    }

    /// All markets, newest first.
    pub async fn list_markets(&self) -> EngineResult<Vec<MarketView>> {
        Ok(self
            .store
            .all_of::<Market>()
            .await?
            .into_iter()
            .map(MarketView::from)
            .collect())
    }

    /// Price a prospective trade without executing it.
    pub async fn quote(&self, market_id: &str, outcome_index: usize, shares: f64) -> EngineResult<Quote> {
        if !(shares > 0.0 && shares.is_finite()) {
            return reject(RejectReason::NonPositiveShares(shares));
        }
        let market = self.load_market(market_id).await?.doc;
        let buy = amm_core::quote_trade(&market.pools, outcome_index, shares, Side::Buy, &self.params)?;
        debug!(market_id, outcome_index, shares, cost = buy.cost, "quote");

        Ok(Quote {
            market_id: market.id.clone(),
            outcome_index,
            shares,
            buy_cost: buy.cost,
            sell_refund: buy.cost * self.params.sell_refund_rate,
            prices: market.prices(),
            prices_after_buy: buy.prices_after,
        })
    }

    /// Buy or sell `shares` of one outcome.
    ///
    /// Sells are not checked against the user's holdings: selling without a
    /// position lowers the pool and credits the refund all the same.
    pub async fn execute_trade(&self, request: TradeRequest) -> EngineResult<TradeReceipt> {
        // Validate inputs first (outside the retry loop)
        if !(request.shares > 0.0 && request.shares.is_finite()) {
            return reject(RejectReason::NonPositiveShares(request.shares));
        }

        let receipt = with_market_retry!(request.market_id, {
            self.execute_trade_attempt(&request).await
        })?;

        self.publish(MarketEvent::TradeExecuted {
            trade: receipt.trade.clone(),
            pools: receipt.market.pools.clone(),
        });
        Ok(receipt)
    }

    async fn execute_trade_attempt(&self, request: &TradeRequest) -> EngineResult<TradeReceipt> {
        // Read phase: everything the trade depends on
        let market = self.load_market(&request.market_id).await?;
        if !market.doc.is_active() {
            return reject(RejectReason::MarketNotActive(request.market_id.clone()));
        }
        let user = self.load_user(&request.user_id).await?;

        let quote = amm_core::quote_trade(
            &market.doc.pools,
            request.outcome_index,
            request.shares,
            request.side,
            &self.params,
        )?;

        if request.side == Side::Buy && quote.cost > user.doc.balance {
            return reject(RejectReason::InsufficientBalance {
                cost: quote.cost,
                balance: user.doc.balance,
            });
        }

        let existing_position = self
            .store
            .all_of::<Position>()
            .await?
            .into_iter()
            .find(|p| p.matches(&request.market_id, &request.user_id, request.outcome_index));

        // 1. Pools, guarded by the market revision
        let mut next_market = market.doc;
        next_market.pools = quote.pools_after.clone();
        self.store
            .put_if_revision(next_market.clone().into(), market.revision)
            .await?;

        // 2. Balance
        let mut next_user = user.doc;
        next_user.balance += quote.balance_delta;
        self.store.put(next_user.clone().into()).await?;

        // 3. Trade log
        let trade = Trade {
            id: new_id(),
            market_id: request.market_id.clone(),
            user_id: request.user_id.clone(),
            outcome_index: request.outcome_index,
            shares: quote.signed_shares(),
            cost: quote.logged_cost,
            prices: quote.prices_after.clone(),
            timestamp: Utc::now(),
        };
        self.store.put(trade.clone().into()).await?;

        // 4. Position
        let position = match (existing_position, request.side) {
            (Some(mut position), _) => {
                position.shares += quote.signed_shares();
                position.total_cost += quote.basis_delta;
                position.updated_at = Utc::now();
                self.store.put(position.clone().into()).await?;
                Some(position)
            }
            (None, Side::Buy) => {
                let position = Position::open(
                    &request.market_id,
                    &request.user_id,
                    request.outcome_index,
                    request.shares,
                    quote.cost,
                );
                self.store.put(position.clone().into()).await?;
                Some(position)
            }
            (None, Side::Sell) => None,
        };

        info!(
            market_id = %request.market_id,
            user_id = %request.user_id,
            side = request.side.as_str(),
            outcome = request.outcome_index,
            shares = request.shares,
            cost = quote.cost,
            balance = next_user.balance,
            "trade executed"
        );

        Ok(TradeReceipt {
            trade,
            market: next_market,
            balance: next_user.balance,
            position,
        })
    }

    /// Close a market and pay the winning side.
    ///
    /// The winning index is trusted as given; an index with no positions
    /// pays nobody.
    pub async fn resolve_market(
        &self,
        caller_id: &str,
        market_id: &str,
        winning_index: usize,
    ) -> EngineResult<ResolutionSummary> {
        let market = with_market_retry!(market_id, {
            let stored = self.load_market(market_id).await?;
            if stored.doc.creator_id != caller_id {
                return reject(RejectReason::NotCreator);
            }
            if !stored.doc.is_active() {
                return reject(RejectReason::MarketNotActive(market_id.to_string()));
            }

            let mut resolved = stored.doc;
            resolved.status = MarketStatus::Resolved;
            resolved.resolution = Some(winning_index);
            self.store
                .put_if_revision(resolved.clone().into(), stored.revision)
                .await?;
            Ok(resolved)
        })?;

        let winning: Vec<(DocId, f64)> = self
            .store
            .all_of::<Position>()
            .await?
            .into_iter()
            .filter(|p| p.market_id == market_id && p.outcome_index == winning_index)
            .map(|p| (p.user_id, p.shares))
            .collect();

        let mut payouts = Vec::new();
        let shares_by_user: HashMap<DocId, f64> = winning.iter().cloned().collect();
        for (user_id, amount) in amm_core::resolution_payouts(&market.pools, &winning, self.params.payout_rate) {
            let Some(mut user) = self.store.get_as::<User>(&user_id).await? else {
                warn!(%user_id, "winning position holder not found, skipping payout");
                continue;
            };
            user.doc.balance += amount;
            self.store.put(user.doc.into()).await?;
            payouts.push(Payout {
                shares: shares_by_user.get(&user_id).copied().unwrap_or_default(),
                user_id,
                amount,
            });
        }

        let total_pool = market.total_pool();
        let distributed: f64 = payouts.iter().map(|p| p.amount).sum();
        info!(
            market_id,
            winning_index,
            winners = payouts.len(),
            total_pool,
            distributed,
            "market resolved"
        );

        self.publish(MarketEvent::MarketResolved {
            market_id: market_id.to_string(),
            winning_index,
            payouts: payouts.clone(),
        });

        Ok(ResolutionSummary {
            market,
            total_pool,
            payouts,
            distributed,
            retained: total_pool - distributed,
        })
    }

    /// Users ranked by balance plus marked value of open positions.
    pub async fn leaderboard(&self, limit: Option<usize>) -> EngineResult<Vec<LeaderboardEntry>> {
        let users = self.store.all_of::<User>().await?;
        let positions = self.store.all_of::<Position>().await?;
        let markets: HashMap<DocId, Market> = self
            .store
            .all_of::<Market>()
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        let prices: HashMap<&str, Vec<f64>> = markets
            .values()
            .filter(|m| m.is_active())
            .map(|m| (m.id.as_str(), m.prices()))
            .collect();

        let mut board: Vec<LeaderboardEntry> = users
            .into_iter()
            .map(|user| {
                let holdings = positions
                    .iter()
                    .filter(|p| p.user_id == user.id)
                    .filter_map(|p| {
                        let price = prices.get(p.market_id.as_str())?.get(p.outcome_index)?;
                        Some((p.shares, *price))
                    });
                let total_value = amm_core::total_value(user.balance, holdings, self.params.share_notional);
                LeaderboardEntry {
                    user_id: user.id,
                    display_name: user.display_name,
                    balance: user.balance,
                    total_value,
                }
            })
            .collect();

        board.sort_by(|a, b| b.total_value.total_cmp(&a.total_value));
        if let Some(limit) = limit {
            board.truncate(limit);
        }
        Ok(board)
    }

    /// The user's positions holding shares, valued at current prices.
    pub async fn portfolio(&self, user_id: &str) -> EngineResult<Vec<PortfolioEntry>> {
        self.load_user(user_id).await?;
        let markets: HashMap<DocId, Market> = self
            .store
            .all_of::<Market>()
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        let entries = self
            .store
            .all_of::<Position>()
            .await?
            .into_iter()
            .filter(|p| p.user_id == user_id && p.shares > 0.0)
            .filter_map(|position| {
                let market = markets.get(&position.market_id)?;
                let price = *market.prices().get(position.outcome_index)?;
                let outcome = market.outcomes.get(position.outcome_index)?.clone();
                Some(PortfolioEntry {
                    current_value: amm_core::position_value(position.shares, price, self.params.share_notional),
                    question: market.question.clone(),
                    status: market.status,
                    outcome,
                    price,
                    position,
                })
            })
            .collect();
        Ok(entries)
    }

    /// Post-trade price snapshots for one market, oldest first.
    pub async fn price_history(&self, market_id: &str) -> EngineResult<Vec<PricePoint>> {
        self.load_market(market_id).await?;
        let mut points: Vec<PricePoint> = self
            .store
            .all_of::<Trade>()
            .await?
            .into_iter()
            .filter(|t| t.market_id == market_id && !t.prices.is_empty())
            .map(|t| PricePoint {
                timestamp: t.timestamp,
                prices: t.prices,
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}
