//! src/amm_core.rs
//! Pool pricing, slippage cost and settlement math for vibes markets.
//!
//! Everything here is a pure function over a snapshot of pool balances.
//! Reading and writing documents is the job of `market_api`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

pub const DEFAULT_POOL_FLOOR: f64 = 1.0;
pub const DEFAULT_SLIPPAGE_FACTOR: f64 = 0.1;
pub const DEFAULT_SELL_REFUND_RATE: f64 = 0.95;
pub const DEFAULT_PAYOUT_RATE: f64 = 0.9;
pub const DEFAULT_SHARE_NOTIONAL: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmmError {
    #[error("outcome {index} out of range for {len} outcomes")]
    OutcomeOutOfRange { index: usize, len: usize },
    #[error("pool product is zero or non-finite, cannot price trade")]
    DegeneratePools,
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse from string (API boundary conversion)
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("Invalid side: '{}', expected 'buy' or 'sell'", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// +1 for buys, -1 for sells.
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Fee and scaling constants applied by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmmParams {
    pub pool_floor: f64,
    pub slippage_factor: f64,
    pub sell_refund_rate: f64,
    pub payout_rate: f64,
    pub share_notional: f64,
}

impl Default for AmmParams {
    fn default() -> Self {
        Self {
            pool_floor: DEFAULT_POOL_FLOOR,
            slippage_factor: DEFAULT_SLIPPAGE_FACTOR,
            sell_refund_rate: DEFAULT_SELL_REFUND_RATE,
            payout_rate: DEFAULT_PAYOUT_RATE,
            share_notional: DEFAULT_SHARE_NOTIONAL,
        }
    }
}

/// Implied probability of each outcome: its pool's share of the total.
/// Falls back to a uniform distribution when the total is zero.
pub fn calculate_prices(pools: &[f64]) -> Vec<f64> {
    let total: f64 = pools.iter().sum();
    let n = pools.len() as f64;
    pools
        .iter()
        .map(|p| if total > 0.0 { p / total } else { 1.0 / n })
        .collect()
}

/// Cost of `shares` of outcome `index` against `pools`.
///
/// `|shares * (k'/k - 1) * slippage + shares * price[index]|` where `k` is the
/// product of all pools and `k'` the product after adding `shares` to the
/// traded pool. The same figure prices sells; the refund rate is applied by
/// the caller.
pub fn calculate_buy_cost(
    pools: &[f64],
    index: usize,
    shares: f64,
    slippage_factor: f64,
) -> Result<f64, AmmError> {
    let current = *pools.get(index).ok_or(AmmError::OutcomeOutOfRange {
        index,
        len: pools.len(),
    })?;

    let k: f64 = pools.iter().product();
    if k == 0.0 || !k.is_finite() {
        return Err(AmmError::DegeneratePools);
    }
    let k_after: f64 = pools
        .iter()
        .enumerate()
        .map(|(i, p)| if i == index { p + shares } else { *p })
        .product();
    let total: f64 = pools.iter().sum();

    let slippage = shares * (k_after / k - 1.0) * slippage_factor;
    let base = shares * (current / total);
    let cost = (slippage + base).abs();

    if !cost.is_finite() {
        return Err(AmmError::DegeneratePools);
    }
    Ok(cost)
}

/// Pools after moving `signed_shares` into outcome `index`, floored.
pub fn apply_shares(pools: &[f64], index: usize, signed_shares: f64, floor: f64) -> Vec<f64> {
    let mut next = pools.to_vec();
    if let Some(pool) = next.get_mut(index) {
        *pool += signed_shares;
        if *pool < floor {
            *pool = floor;
        }
    }
    next
}

/// Everything a trade changes, computed from one pool snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeQuote {
    pub side: Side,
    pub shares: f64,
    /// Unsigned formula cost.
    pub cost: f64,
    /// Change to the trader's balance: `-cost` or `+refund_rate * cost`.
    pub balance_delta: f64,
    /// Signed cost recorded on the trade log.
    pub logged_cost: f64,
    /// Change to the position's cost basis: `+cost` or `-cost`.
    pub basis_delta: f64,
    pub pools_after: Vec<f64>,
    pub prices_after: Vec<f64>,
}

impl TradeQuote {
    pub fn signed_shares(&self) -> f64 {
        self.side.sign() * self.shares
    }
}

pub fn quote_trade(
    pools: &[f64],
    index: usize,
    shares: f64,
    side: Side,
    params: &AmmParams,
) -> Result<TradeQuote, AmmError> {
    let cost = calculate_buy_cost(pools, index, shares, params.slippage_factor)?;
    let pools_after = apply_shares(pools, index, side.sign() * shares, params.pool_floor);
    let prices_after = calculate_prices(&pools_after);

    let (balance_delta, logged_cost, basis_delta) = match side {
        Side::Buy => (-cost, cost, cost),
        Side::Sell => {
            let refund = cost * params.sell_refund_rate;
            (refund, -refund, -cost)
        }
    };

    Ok(TradeQuote {
        side,
        shares,
        cost,
        balance_delta,
        logged_cost,
        basis_delta,
        pools_after,
        prices_after,
    })
}

/// Pro-rata split of `payout_rate` of the whole pool over the winning holders.
///
/// Returns nothing when the winning shares sum to zero or less; whatever is
/// not paid out stays with no one.
pub fn resolution_payouts<K: Clone>(
    pools: &[f64],
    winning: &[(K, f64)],
    payout_rate: f64,
) -> Vec<(K, f64)> {
    let total_winning: f64 = winning.iter().map(|(_, shares)| shares).sum();
    if total_winning <= 0.0 {
        return Vec::new();
    }
    let total_pool: f64 = pools.iter().sum();
    winning
        .iter()
        .map(|(holder, shares)| {
            (
                holder.clone(),
                (shares / total_winning) * total_pool * payout_rate,
            )
        })
        .collect()
}

/// Marked value of an open holding.
#[inline]
pub fn position_value(shares: f64, price: f64, share_notional: f64) -> f64 {
    shares * price * share_notional
}

/// Balance plus the marked value of every `(shares, price)` holding with
/// positive shares.
pub fn total_value<I>(balance: f64, holdings: I, share_notional: f64) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    balance
        + holdings
            .into_iter()
            .filter(|(shares, _)| *shares > 0.0)
            .map(|(shares, price)| position_value(shares, price, share_notional))
            .sum::<f64>()
}
