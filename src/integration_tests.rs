//! Integration tests for the PostgreSQL document store
//!
//! These tests verify the store contract and the engine running on it:
//! - revisions, compare-and-swap conflicts, newest-first queries
//! - a full create, trade, resolve cycle
//! - concurrent trades on one market keep every update
//!
//! They need a reachable database in `TEST_DB_URL` and are skipped
//! otherwise. Each test works in its own throwaway schema.

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

use crate::pg_store::PgDocumentStore;

fn test_db_url() -> Option<String> {
    env::var("TEST_DB_URL").ok().filter(|url| !url.trim().is_empty())
}

/// A store bound to a fresh schema, plus the admin pool that owns it.
struct TestDb {
    admin: PgPool,
    schema: String,
    store: PgDocumentStore,
}

impl TestDb {
    async fn setup() -> Result<Option<Self>> {
        let Some(url) = test_db_url() else {
            println!("TEST_DB_URL not set, skipping PostgreSQL test");
            return Ok(None);
        };

        let admin = PgPoolOptions::new().max_connections(2).connect(&url).await?;
        let schema = format!("market_test_{}", uuid::Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA {}", schema))
            .execute(&admin)
            .await?;

        let options = PgConnectOptions::from_str(&url)?.options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        let store = PgDocumentStore::new(pool);
        store.migrate().await?;

        Ok(Some(Self { admin, schema, store }))
    }

    async fn teardown(self) -> Result<()> {
        self.store.pool().close().await;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&self.admin)
            .await?;
        self.admin.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    use crate::amm_core::Side;
    use crate::config::MarketConfig;
    use crate::documents::{new_id, DocType, Document, Market, Trade, User};
    use crate::market_api::{EngineError, MarketEngine, NewMarket, TradeRequest};
    use crate::store::{DocumentStore, DocumentStoreExt, StoreError};

    fn trade_at(market_id: &str, minutes_ago: i64) -> Trade {
        Trade {
            id: new_id(),
            market_id: market_id.to_string(),
            user_id: "u".to_string(),
            outcome_index: 0,
            shares: 1.0,
            cost: 0.5,
            prices: vec![0.5, 0.5],
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn put_increments_revision_and_round_trips_body() -> Result<()> {
        let Some(db) = TestDb::setup().await? else { return Ok(()) };

        let mut user = User::new("ada", 1000.0);
        let first = db.store.put(user.clone().into()).await?;
        assert_eq!(first.revision, 1);

        user.balance = 990.5;
        let second = db.store.put(user.clone().into()).await?;
        assert_eq!(second.revision, 2);

        let loaded = db.store.get_as::<User>(&user.id).await?.expect("stored user");
        assert_eq!(loaded.revision, 2);
        assert_eq!(loaded.doc, user);
        assert!(db.store.get("missing").await?.is_none());

        db.teardown().await
    }

    #[tokio::test]
    async fn compare_and_swap_detects_stale_writers() -> Result<()> {
        let Some(db) = TestDb::setup().await? else { return Ok(()) };

        let market = Market::new("Rain?", vec!["Yes".into(), "No".into()], 100.0, None, "creator");
        let created = db.store.put_if_revision(market.clone().into(), 0).await?;
        assert_eq!(created.revision, 1);

        // A second create of the same id loses
        match db.store.put_if_revision(market.clone().into(), 0).await {
            Err(StoreError::Conflict { expected, found, .. }) => {
                assert_eq!(expected, 0);
                assert_eq!(found, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let mut updated = market.clone();
        updated.pools = vec![110.0, 100.0];
        let written = db.store.put_if_revision(updated.clone().into(), 1).await?;
        assert_eq!(written.revision, 2);

        // The old snapshot is now stale
        assert!(matches!(
            db.store.put_if_revision(market.into(), 1).await,
            Err(StoreError::Conflict { found: 2, .. })
        ));
        let current = db.store.get_as::<Market>(&updated.id).await?.expect("market");
        assert_eq!(current.doc.pools, vec![110.0, 100.0]);

        db.teardown().await
    }

    #[tokio::test]
    async fn query_returns_one_type_newest_first() -> Result<()> {
        let Some(db) = TestDb::setup().await? else { return Ok(()) };

        let oldest = trade_at("m", 30);
        let middle = trade_at("m", 20);
        let newest = trade_at("m", 10);
        for trade in [&middle, &oldest, &newest] {
            db.store.put(trade.clone().into()).await?;
        }
        db.store.put(User::new("ada", 1000.0).into()).await?;

        let all = db.store.query(DocType::Trade, None).await?;
        let ids: Vec<&str> = all.iter().map(|s| s.doc.id()).collect();
        assert_eq!(ids, vec![newest.id.as_str(), middle.id.as_str(), oldest.id.as_str()]);
        assert!(all.iter().all(|s| matches!(s.doc, Document::Trade(_))));

        let limited = db.store.query_as::<Trade>(Some(2)).await?;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].doc.id, newest.id);

        db.teardown().await
    }

    #[tokio::test]
    async fn engine_cycle_on_postgres() -> Result<()> {
        let Some(db) = TestDb::setup().await? else { return Ok(()) };
        let engine = MarketEngine::new(db.store.clone(), MarketConfig::default());

        let alice = engine.create_user("alice").await?;
        let bob = engine.create_user("bob").await?;
        let market = engine
            .create_market(
                &alice.id,
                NewMarket {
                    question: "Will it rain?".to_string(),
                    outcomes: vec!["Yes".to_string(), "No".to_string()],
                    deadline: None,
                },
            )
            .await?;

        let receipt = engine
            .execute_trade(TradeRequest {
                user_id: bob.id.clone(),
                market_id: market.id.clone(),
                outcome_index: 0,
                shares: 10.0,
                side: Side::Buy,
            })
            .await?;
        assert_eq!(receipt.market.pools, vec![110.0, 100.0]);
        assert!((receipt.balance - 994.9).abs() < 1e-9);

        let summary = engine.resolve_market(&alice.id, &market.id, 0).await?;
        assert!((summary.distributed - 189.0).abs() < 1e-9);
        let bob_after = engine.user(&bob.id).await?;
        assert!((bob_after.balance - (994.9 + 189.0)).abs() < 1e-9);

        let history = engine.price_history(&market.id).await?;
        assert_eq!(history.len(), 1);

        db.teardown().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_buys_never_lose_pool_updates() -> Result<()> {
        let Some(db) = TestDb::setup().await? else { return Ok(()) };
        let engine = Arc::new(MarketEngine::new(db.store.clone(), MarketConfig::default()));

        let creator = engine.create_user("creator").await?;
        let market = engine
            .create_market(
                &creator.id,
                NewMarket {
                    question: "Busy?".to_string(),
                    outcomes: vec!["Yes".to_string(), "No".to_string()],
                    deadline: None,
                },
            )
            .await?;

        let mut handles = Vec::new();
        for i in 0..12 {
            let engine = Arc::clone(&engine);
            let market_id = market.id.clone();
            handles.push(tokio::spawn(async move {
                let user = engine.create_user(&format!("trader_{}", i)).await?;
                engine
                    .execute_trade(TradeRequest {
                        user_id: user.id,
                        market_id,
                        outcome_index: 0,
                        shares: 5.0,
                        side: Side::Buy,
                    })
                    .await
            }));
        }

        let mut executed = 0usize;
        for handle in handles {
            match handle.await? {
                Ok(_) => executed += 1,
                Err(EngineError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let stored = engine.store().get_as::<Market>(&market.id).await?.expect("market");
        assert_eq!(stored.doc.pools[0], 100.0 + 5.0 * executed as f64);
        assert_eq!(stored.revision, 1 + executed as u64);
        assert_eq!(engine.store().all_of::<Trade>().await?.len(), executed);

        db.teardown().await
    }
}
