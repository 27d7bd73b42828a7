//! Configuration management for the market engine
//! Supports environment variables and default values for market parameters

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use tracing::{info, warn};

use crate::amm_core::{
    AmmParams, DEFAULT_PAYOUT_RATE, DEFAULT_POOL_FLOOR, DEFAULT_SELL_REFUND_RATE,
    DEFAULT_SHARE_NOTIONAL, DEFAULT_SLIPPAGE_FACTOR,
};

const DEFAULT_INITIAL_BALANCE: f64 = 1000.0;
const DEFAULT_INITIAL_POOL: f64 = 100.0;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Configuration for the market engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub market: MarketConfig,
    pub server: ServerConfig,
}

/// Market-specific configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Starting balance for new users (default: 1000)
    pub initial_balance: f64,

    /// Starting pool for every outcome of a new market (default: 100)
    pub initial_pool: f64,

    /// Minimum pool balance after any trade (default: 1)
    pub pool_floor: f64,

    /// Weight of the product-ratio slippage term (default: 0.1)
    pub slippage_factor: f64,

    /// Share of the quoted cost returned to sellers (default: 0.95)
    pub sell_refund_rate: f64,

    /// Share of the total pool paid to winners on resolution (default: 0.9)
    pub payout_rate: f64,

    /// Notional per full share on the leaderboard and portfolio (default: 100)
    pub share_notional: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            initial_balance: DEFAULT_INITIAL_BALANCE,
            initial_pool: DEFAULT_INITIAL_POOL,
            pool_floor: DEFAULT_POOL_FLOOR,
            slippage_factor: DEFAULT_SLIPPAGE_FACTOR,
            sell_refund_rate: DEFAULT_SELL_REFUND_RATE,
            payout_rate: DEFAULT_PAYOUT_RATE,
            share_notional: DEFAULT_SHARE_NOTIONAL,
        }
    }
}

impl MarketConfig {
    pub fn amm_params(&self) -> AmmParams {
        AmmParams {
            pool_floor: self.pool_floor,
            slippage_factor: self.slippage_factor,
            sell_refund_rate: self.sell_refund_rate,
            payout_rate: self.payout_rate,
            share_notional: self.share_notional,
        }
    }
}

/// HTTP server and store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// PostgreSQL URL; the in-memory store is used when absent
    pub database_url: Option<String>,

    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            database_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}: {:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let defaults = MarketConfig::default();

        let market = MarketConfig {
            initial_balance: env_parse("MARKET_INITIAL_BALANCE", defaults.initial_balance),
            initial_pool: env_parse("MARKET_INITIAL_POOL", defaults.initial_pool),
            pool_floor: env_parse("MARKET_POOL_FLOOR", defaults.pool_floor),
            slippage_factor: env_parse("MARKET_SLIPPAGE_FACTOR", defaults.slippage_factor),
            sell_refund_rate: env_parse("MARKET_SELL_REFUND_RATE", defaults.sell_refund_rate),
            payout_rate: env_parse("MARKET_PAYOUT_RATE", defaults.payout_rate),
            share_notional: env_parse("MARKET_SHARE_NOTIONAL", defaults.share_notional),
        };

        let server = ServerConfig {
            bind_addr: env_parse("SERVER_BIND_ADDR", ServerConfig::default().bind_addr),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.trim().is_empty()),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS),
        };

        let mut config = Config { market, server };

        // Validate configuration
        config.validate();

        config
    }

    /// Validate configuration values
    pub fn validate(&mut self) {
        let defaults = MarketConfig::default();
        let market = &mut self.market;

        if !(market.initial_balance.is_finite() && market.initial_balance >= 0.0) {
            warn!("Invalid initial_balance: {}, using default", market.initial_balance);
            market.initial_balance = defaults.initial_balance;
        }

        // Pools must start positive and never floor at or below zero
        if !(market.pool_floor.is_finite() && market.pool_floor > 0.0) {
            warn!("Invalid pool_floor: {}, using default", market.pool_floor);
            market.pool_floor = defaults.pool_floor;
        }

        if !(market.initial_pool.is_finite() && market.initial_pool >= market.pool_floor) {
            warn!("Invalid initial_pool: {}, using default", market.initial_pool);
            market.initial_pool = defaults.initial_pool.max(market.pool_floor);
        }

        if !(market.slippage_factor.is_finite() && market.slippage_factor >= 0.0) {
            warn!("Invalid slippage_factor: {}, using default", market.slippage_factor);
            market.slippage_factor = defaults.slippage_factor;
        }

        if !(0.0..=1.0).contains(&market.sell_refund_rate) {
            warn!("Invalid sell_refund_rate: {}, using default", market.sell_refund_rate);
            market.sell_refund_rate = defaults.sell_refund_rate;
        }

        if !(0.0..=1.0).contains(&market.payout_rate) {
            warn!("Invalid payout_rate: {}, using default", market.payout_rate);
            market.payout_rate = defaults.payout_rate;
        }

        if !(market.share_notional.is_finite() && market.share_notional > 0.0) {
            warn!("Invalid share_notional: {}, using default", market.share_notional);
            market.share_notional = defaults.share_notional;
        }

        if self.server.max_connections == 0 {
            warn!("Invalid max_connections: 0, using default");
            self.server.max_connections = DEFAULT_MAX_CONNECTIONS;
        }
    }

    /// Log current configuration
    pub fn log_config(&self) {
        info!("Market Engine Configuration:");
        info!("   Initial Balance: {}", self.market.initial_balance);
        info!("   Initial Pool: {}", self.market.initial_pool);
        info!("   Pool Floor: {}", self.market.pool_floor);
        info!("   Slippage Factor: {}", self.market.slippage_factor);
        info!("   Sell Refund Rate: {}", self.market.sell_refund_rate);
        info!("   Payout Rate: {}", self.market.payout_rate);
        info!("   Share Notional: {}", self.market.share_notional);
        info!("   Bind Address: {}", self.server.bind_addr);
        info!(
            "   Store: {}",
            if self.server.database_url.is_some() { "postgres" } else { "memory" }
        );
    }
}
