//! Document types persisted in the store.
//!
//! Field names serialize in camelCase with a `type` discriminator so the web
//! client reads the same JSON it always has. TypeScript bindings are
//! generated by `ts-rs` when the test suite runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::amm_core::calculate_prices;

pub type DocId = String;

pub fn new_id() -> DocId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct User {
    pub id: DocId,
    pub display_name: String,
    pub balance: f64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(display_name: &str, balance: f64) -> Self {
        Self {
            id: new_id(),
            display_name: display_name.to_string(),
            balance,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum MarketStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Market {
    pub id: DocId,
    pub question: String,
    pub outcomes: Vec<String>,
    /// One balance per outcome, parallel to `outcomes`.
    pub pools: Vec<f64>,
    pub status: MarketStatus,
    pub resolution: Option<usize>,
    pub deadline: Option<DateTime<Utc>>,
    pub creator_id: DocId,
    pub created_at: DateTime<Utc>,
}

impl Market {
    pub fn new(
        question: &str,
        outcomes: Vec<String>,
        initial_pool: f64,
        deadline: Option<DateTime<Utc>>,
        creator_id: &str,
    ) -> Self {
        let pools = vec![initial_pool; outcomes.len()];
        Self {
            id: new_id(),
            question: question.to_string(),
            outcomes,
            pools,
            status: MarketStatus::Active,
            resolution: None,
            deadline,
            creator_id: creator_id.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MarketStatus::Active
    }

    pub fn prices(&self) -> Vec<f64> {
        calculate_prices(&self.pools)
    }

    pub fn total_pool(&self) -> f64 {
        self.pools.iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Position {
    pub id: DocId,
    pub market_id: DocId,
    pub user_id: DocId,
    pub outcome_index: usize,
    pub shares: f64,
    pub total_cost: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(market_id: &str, user_id: &str, outcome_index: usize, shares: f64, cost: f64) -> Self {
        Self {
            id: new_id(),
            market_id: market_id.to_string(),
            user_id: user_id.to_string(),
            outcome_index,
            shares,
            total_cost: cost,
            updated_at: Utc::now(),
        }
    }

    pub fn matches(&self, market_id: &str, user_id: &str, outcome_index: usize) -> bool {
        self.market_id == market_id && self.user_id == user_id && self.outcome_index == outcome_index
    }
}

/// Append-only trade log entry, kept for price charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Trade {
    pub id: DocId,
    pub market_id: DocId,
    pub user_id: DocId,
    pub outcome_index: usize,
    /// Positive for buys, negative for sells.
    pub shares: f64,
    /// Cash paid (positive) or received (negative).
    pub cost: f64,
    /// Implied prices of every outcome right after the trade.
    pub prices: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    User,
    Market,
    Position,
    Trade,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::User => "user",
            DocType::Market => "market",
            DocType::Position => "position",
            DocType::Trade => "trade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "lowercase")]
#[ts(export)]
pub enum Document {
    User(User),
    Market(Market),
    Position(Position),
    Trade(Trade),
}

impl Document {
    pub fn id(&self) -> &str {
        match self {
            Document::User(d) => &d.id,
            Document::Market(d) => &d.id,
            Document::Position(d) => &d.id,
            Document::Trade(d) => &d.id,
        }
    }

    pub fn doc_type(&self) -> DocType {
        match self {
            Document::User(_) => DocType::User,
            Document::Market(_) => DocType::Market,
            Document::Position(_) => DocType::Position,
            Document::Trade(_) => DocType::Trade,
        }
    }

    /// Time used to order type queries, newest first.
    pub fn sort_at(&self) -> DateTime<Utc> {
        match self {
            Document::User(d) => d.created_at,
            Document::Market(d) => d.created_at,
            Document::Position(d) => d.updated_at,
            Document::Trade(d) => d.timestamp,
        }
    }
}

/// Typed access to one variant of [`Document`].
pub trait DocumentKind: Sized {
    const TYPE: DocType;
    fn from_document(doc: Document) -> Option<Self>;
    fn into_document(self) -> Document;
}

macro_rules! document_kind {
    ($ty:ident, $variant:ident) => {
        impl DocumentKind for $ty {
            const TYPE: DocType = DocType::$variant;

            fn from_document(doc: Document) -> Option<Self> {
                match doc {
                    Document::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_document(self) -> Document {
                Document::$variant(self)
            }
        }

        impl From<$ty> for Document {
            fn from(value: $ty) -> Self {
                value.into_document()
            }
        }
    };
}

document_kind!(User, User);
document_kind!(Market, Market);
document_kind!(Position, Position);
document_kind!(Trade, Trade);
