//! Concurrent trading simulation for the market engine
//!
//! This module exercises:
//! 1. **Correctness**: pricing, floors and resolution payouts under load
//! 2. **Ledger Invariants**: balances and positions agree with the trade log
//! 3. **Concurrency**: many traders hitting the same markets at once
//! 4. **Performance**: trade throughput against the configured store

use anyhow::{anyhow, Result};
use rand::prelude::*;
use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::amm_core::Side;
use crate::documents::{Market, Position, Trade, User};
use crate::market_api::{EngineError, MarketEngine, NewMarket, TradeRequest};
use crate::store::{DocumentStore, DocumentStoreExt};

// Simulation Parameters (defaults; override via STRESS_* env vars)
const NUM_USERS: usize = 50;
const NUM_MARKETS: usize = 10;
const TRADES_PER_USER: usize = 40;
const MAX_OUTCOMES: usize = 4;
const MAX_BUY_SHARES: f64 = 10.0;
const SELL_PROBABILITY: f64 = 0.25;

// Tolerance when comparing balances rebuilt from the trade log
const LEDGER_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub num_users: usize,
    pub num_markets: usize,
    pub trades_per_user: usize,
    pub max_outcomes: usize,
    pub max_buy_shares: f64,
    pub sell_probability: f64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_users: NUM_USERS,
            num_markets: NUM_MARKETS,
            trades_per_user: TRADES_PER_USER,
            max_outcomes: MAX_OUTCOMES,
            max_buy_shares: MAX_BUY_SHARES,
            sell_probability: SELL_PROBABILITY,
        }
    }
}

impl StressConfig {
    pub fn from_env() -> Self {
        Self {
            num_users: env_usize("STRESS_NUM_USERS", NUM_USERS),
            num_markets: env_usize("STRESS_NUM_MARKETS", NUM_MARKETS),
            trades_per_user: env_usize("STRESS_TRADES_PER_USER", TRADES_PER_USER),
            max_outcomes: env_usize("STRESS_MAX_OUTCOMES", MAX_OUTCOMES).max(2),
            max_buy_shares: env_f64_min("STRESS_MAX_BUY_SHARES", MAX_BUY_SHARES, 1.0),
            sell_probability: env_f64_clamped("STRESS_SELL_PROBABILITY", SELL_PROBABILITY, 0.0, 1.0),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn env_f64_clamped(name: &str, default: f64, min: f64, max: f64) -> f64 {
    env_f64(name, default).clamp(min, max)
}

fn env_f64_min(name: &str, default: f64, min: f64) -> f64 {
    env_f64(name, default).max(min)
}

#[derive(Debug, Clone, Copy)]
enum TradeOutcome {
    Executed,
    Skipped,
    Conflicted,
}

#[derive(Debug, Clone, Default)]
pub struct StressReport {
    pub executed: u64,
    pub skipped: u64,
    pub conflicted: u64,
    pub trades_per_second: f64,
    pub total_pool: f64,
    pub total_paid_out: f64,
}

/// Holdings a simulated trader keeps track of locally, keyed by
/// (market index, outcome index).
type Holdings = HashMap<(usize, usize), f64>;

async fn try_execute_trade<S: DocumentStore>(
    engine: &MarketEngine<S>,
    stress: &StressConfig,
    user: &User,
    market_id: &str,
    market_idx: usize,
    num_outcomes: usize,
    holdings: &mut Holdings,
) -> Result<TradeOutcome> {
    // Decide the trade up front; the rng must not live across an await
    let (side, outcome_index, shares) = {
        let mut rng = thread_rng();
        let held: Vec<((usize, usize), f64)> = holdings
            .iter()
            .filter(|((m, _), shares)| *m == market_idx && **shares > 0.0)
            .map(|(k, v)| (*k, *v))
            .collect();

        if !held.is_empty() && rng.gen::<f64>() < stress.sell_probability {
            let ((_, outcome), available) = held[rng.gen_range(0..held.len())];
            let fraction = 0.1 + rng.gen::<f64>() * 0.5; // 10% to 60% of holdings
            (Side::Sell, outcome, (available * fraction).min(available))
        } else {
            let shares = rng.gen_range(1.0..=stress.max_buy_shares).round();
            (Side::Buy, rng.gen_range(0..num_outcomes), shares)
        }
    };

    let request = TradeRequest {
        user_id: user.id.clone(),
        market_id: market_id.to_string(),
        outcome_index,
        shares,
        side,
    };

    match engine.execute_trade(request).await {
        Ok(_) => {
            *holdings.entry((market_idx, outcome_index)).or_insert(0.0) += side.sign() * shares;
            Ok(TradeOutcome::Executed)
        }
        Err(EngineError::Rejected(_)) => Ok(TradeOutcome::Skipped),
        Err(EngineError::Conflict { .. }) => Ok(TradeOutcome::Conflicted),
        Err(err) => Err(err.into()),
    }
}

/// Creates users and markets, trades concurrently, checks the ledger,
/// then resolves every market.
pub async fn run_stress_test<S>(engine: Arc<MarketEngine<S>>, stress: &StressConfig) -> Result<StressReport>
where
    S: DocumentStore + 'static,
{
    let initial_balance = engine.config().initial_balance;

    let mut users = Vec::with_capacity(stress.num_users);
    for i in 0..stress.num_users {
        users.push(engine.create_user(&format!("stress_user_{}", i)).await?);
    }
    info!("Created {} test users", users.len());

    let mut markets = Vec::with_capacity(stress.num_markets);
    for i in 0..stress.num_markets {
        let outcomes = 2 + i % (stress.max_outcomes - 1);
        let creator = &users[i % users.len()];
        let market = engine
            .create_market(
                &creator.id,
                NewMarket {
                    question: format!("Stress market {}?", i),
                    outcomes: (0..outcomes).map(|o| format!("Outcome {}", o)).collect(),
                    deadline: None,
                },
            )
            .await?;
        markets.push(market);
    }
    info!("Created {} test markets", markets.len());

    info!(
        "Starting market simulation: {} trades ({} users x {} trades each)",
        stress.num_users * stress.trades_per_user,
        stress.num_users,
        stress.trades_per_user
    );
    let start_time = Instant::now();

    let market_refs: Arc<Vec<(String, usize)>> = Arc::new(
        markets
            .iter()
            .map(|m| (m.id.clone(), m.outcomes.len()))
            .collect(),
    );

    let mut handles = Vec::with_capacity(users.len());
    for user in users.iter().cloned() {
        let engine = Arc::clone(&engine);
        let stress = stress.clone();
        let market_refs = Arc::clone(&market_refs);
        handles.push(tokio::spawn(async move {
            let mut holdings = Holdings::new();
            let mut counts = (0u64, 0u64, 0u64);
            for _ in 0..stress.trades_per_user {
                let market_idx = thread_rng().gen_range(0..market_refs.len());
                let (market_id, num_outcomes) = &market_refs[market_idx];
                match try_execute_trade(
                    &engine,
                    &stress,
                    &user,
                    market_id,
                    market_idx,
                    *num_outcomes,
                    &mut holdings,
                )
                .await?
                {
                    TradeOutcome::Executed => counts.0 += 1,
                    TradeOutcome::Skipped => counts.1 += 1,
                    TradeOutcome::Conflicted => counts.2 += 1,
                }
            }
            Ok::<_, anyhow::Error>(counts)
        }));
    }

    let mut report = StressReport::default();
    for handle in handles {
        let (executed, skipped, conflicted) = handle.await??;
        report.executed += executed;
        report.skipped += skipped;
        report.conflicted += conflicted;
    }

    let elapsed = start_time.elapsed().as_secs_f64();
    report.trades_per_second = if elapsed > 0.0 { report.executed as f64 / elapsed } else { 0.0 };

    verify_ledger(engine.as_ref(), initial_balance, report.executed, &users, &market_refs).await?;

    // Resolve every market in favour of a random outcome
    for market in &markets {
        let view = engine.market_view(&market.id).await?;
        let winner = thread_rng().gen_range(0..market.outcomes.len());
        let summary = engine.resolve_market(&market.creator_id, &market.id, winner).await?;
        if summary.distributed > view.market.total_pool() * engine.config().payout_rate + LEDGER_EPSILON {
            return Err(anyhow!("market {} paid out more than its payout share", market.id));
        }
        report.total_pool += summary.total_pool;
        report.total_paid_out += summary.distributed;
    }

    info!("Ledger invariants maintained.");
    info!("Stress Test Summary:");
    info!("   - Executed trades: {}", report.executed);
    info!("   - Skipped trades: {}", report.skipped);
    info!("   - Conflicted trades: {}", report.conflicted);
    info!("   - Average TPS: {:.2}", report.trades_per_second);
    info!("   - Total pool at resolution: {:.2}", report.total_pool);
    info!("   - Paid out to winners: {:.2}", report.total_paid_out);

    Ok(report)
}

/// Rebuild balances and positions from the trade log and compare.
/// Only documents from this run are checked, so a shared database works.
async fn verify_ledger<S: DocumentStore>(
    engine: &MarketEngine<S>,
    initial_balance: f64,
    executed: u64,
    users: &[User],
    markets: &[(String, usize)],
) -> Result<()> {
    let store = engine.store();
    let market_ids: HashSet<&str> = markets.iter().map(|(id, _)| id.as_str()).collect();
    let user_ids: HashSet<&str> = users.iter().map(|u| u.id.as_str()).collect();

    let trades: Vec<Trade> = store
        .all_of::<Trade>()
        .await?
        .into_iter()
        .filter(|t| market_ids.contains(t.market_id.as_str()))
        .collect();
    if trades.len() as u64 != executed {
        return Err(anyhow!(
            "trade log has {} entries but {} trades executed",
            trades.len(),
            executed
        ));
    }

    let floor = engine.config().pool_floor;
    for market in store.all_of::<Market>().await? {
        if !market_ids.contains(market.id.as_str()) {
            continue;
        }
        if market.pools.len() != market.outcomes.len() {
            return Err(anyhow!("market {} pools/outcomes length mismatch", market.id));
        }
        if market.pools.iter().any(|p| *p < floor) {
            return Err(anyhow!("market {} has a pool below the floor", market.id));
        }
    }

    let mut spent: HashMap<&str, f64> = HashMap::new();
    let mut held: HashMap<(&str, &str, usize), f64> = HashMap::new();
    for trade in &trades {
        *spent.entry(trade.user_id.as_str()).or_default() += trade.cost;
        *held
            .entry((trade.market_id.as_str(), trade.user_id.as_str(), trade.outcome_index))
            .or_default() += trade.shares;
    }

    for user in store.all_of::<User>().await? {
        if !user_ids.contains(user.id.as_str()) {
            continue;
        }
        let expected = initial_balance - spent.get(user.id.as_str()).copied().unwrap_or_default();
        if (user.balance - expected).abs() > LEDGER_EPSILON {
            return Err(anyhow!(
                "balance mismatch for {}: stored {}, rebuilt {}",
                user.id,
                user.balance,
                expected
            ));
        }
    }

    for position in store.all_of::<Position>().await? {
        if !market_ids.contains(position.market_id.as_str()) {
            continue;
        }
        let key = (
            position.market_id.as_str(),
            position.user_id.as_str(),
            position.outcome_index,
        );
        let expected = held.get(&key).copied().unwrap_or_default();
        if (position.shares - expected).abs() > LEDGER_EPSILON {
            warn!(?key, stored = position.shares, rebuilt = expected, "position mismatch");
            return Err(anyhow!("position mismatch for {:?}", key));
        }
    }

    Ok(())
}
