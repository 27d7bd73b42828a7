//! Document store contract and the in-memory implementation.
//!
//! The engine needs only four things from a store: overwrite by id,
//! compare-and-swap on a document's revision, lookup by id, and "all
//! documents of a type, newest first, up to a limit".

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::documents::{DocType, Document, DocumentKind};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The document changed since it was read.
    #[error("revision conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: String, expected: u64, found: u64 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A document together with the revision the store holds for it.
/// Revisions start at 1 and grow by one on every write.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T = Document> {
    pub revision: u64,
    pub doc: T,
}

impl Stored<Document> {
    /// Narrow to one document kind.
    pub fn cast<K: DocumentKind>(self) -> Option<Stored<K>> {
        let revision = self.revision;
        K::from_document(self.doc).map(|doc| Stored { revision, doc })
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create or overwrite by id.
    async fn put(&self, doc: Document) -> StoreResult<Stored>;

    /// Overwrite only when the stored revision equals `expected`.
    async fn put_if_revision(&self, doc: Document, expected: u64) -> StoreResult<Stored>;

    async fn get(&self, id: &str) -> StoreResult<Option<Stored>>;

    /// Documents of one type, newest first.
    async fn query(&self, doc_type: DocType, limit: Option<usize>) -> StoreResult<Vec<Stored>>;
}

/// Typed helpers layered over any [`DocumentStore`].
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn get_as<K>(&self, id: &str) -> StoreResult<Option<Stored<K>>>
    where
        K: DocumentKind + Send,
    {
        Ok(self.get(id).await?.and_then(|stored| stored.cast::<K>()))
    }

    async fn query_as<K>(&self, limit: Option<usize>) -> StoreResult<Vec<Stored<K>>>
    where
        K: DocumentKind + Send,
    {
        Ok(self
            .query(K::TYPE, limit)
            .await?
            .into_iter()
            .filter_map(|stored| stored.cast::<K>())
            .collect())
    }

    async fn all_of<K>(&self) -> StoreResult<Vec<K>>
    where
        K: DocumentKind + Send,
    {
        Ok(self
            .query_as::<K>(None)
            .await?
            .into_iter()
            .map(|stored| stored.doc)
            .collect())
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    async fn put(&self, doc: Document) -> StoreResult<Stored> {
        (**self).put(doc).await
    }

    async fn put_if_revision(&self, doc: Document, expected: u64) -> StoreResult<Stored> {
        (**self).put_if_revision(doc, expected).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Stored>> {
        (**self).get(id).await
    }

    async fn query(&self, doc_type: DocType, limit: Option<usize>) -> StoreResult<Vec<Stored>> {
        (**self).query(doc_type, limit).await
    }
}

/// Process-local store. Cloning shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<String, Stored>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put(&self, doc: Document) -> StoreResult<Stored> {
        let mut docs = self.docs.write().await;
        let revision = docs.get(doc.id()).map_or(0, |s| s.revision) + 1;
        let stored = Stored { revision, doc };
        docs.insert(stored.doc.id().to_string(), stored.clone());
        Ok(stored)
    }

    async fn put_if_revision(&self, doc: Document, expected: u64) -> StoreResult<Stored> {
        let mut docs = self.docs.write().await;
        let found = docs.get(doc.id()).map_or(0, |s| s.revision);
        if found != expected {
            return Err(StoreError::Conflict {
                id: doc.id().to_string(),
                expected,
                found,
            });
        }
        let stored = Stored {
            revision: found + 1,
            doc,
        };
        docs.insert(stored.doc.id().to_string(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Stored>> {
        Ok(self.docs.read().await.get(id).cloned())
    }

    async fn query(&self, doc_type: DocType, limit: Option<usize>) -> StoreResult<Vec<Stored>> {
        let docs = self.docs.read().await;
        let mut matching: Vec<Stored> = docs
            .values()
            .filter(|s| s.doc.doc_type() == doc_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.doc.sort_at().cmp(&a.doc.sort_at()));
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{Market, Trade, User};
    use chrono::{Duration, Utc};

    fn trade_at(minutes_ago: i64) -> Trade {
        Trade {
            id: crate::documents::new_id(),
            market_id: "m".into(),
            user_id: "u".into(),
            outcome_index: 0,
            shares: 1.0,
            cost: 0.5,
            prices: vec![0.5, 0.5],
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn put_bumps_revision_and_overwrites() {
        let store = MemoryStore::new();
        let mut user = User::new("ada", 1000.0);
        let first = store.put(user.clone().into()).await.unwrap();
        assert_eq!(first.revision, 1);

        user.balance = 900.0;
        let second = store.put(user.clone().into()).await.unwrap();
        assert_eq!(second.revision, 2);

        let fetched = store.get_as::<User>(&user.id).await.unwrap().unwrap();
        assert_eq!(fetched.revision, 2);
        assert_eq!(fetched.doc.balance, 900.0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let store = MemoryStore::new();
        let market = Market::new("q", vec!["a".into(), "b".into()], 100.0, None, "u");
        store.put(market.clone().into()).await.unwrap();
        store.put_if_revision(market.clone().into(), 1).await.unwrap();

        let err = store.put_if_revision(market.into(), 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, found: 2, .. }));
    }

    #[tokio::test]
    async fn create_through_cas_expects_revision_zero() {
        let store = MemoryStore::new();
        let user = User::new("bob", 1000.0);
        let stored = store.put_if_revision(user.into(), 0).await.unwrap();
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_limits() {
        let store = MemoryStore::new();
        let old = trade_at(10);
        let mid = trade_at(5);
        let new = trade_at(0);
        for t in [mid.clone(), old.clone(), new.clone()] {
            store.put(t.into()).await.unwrap();
        }
        store.put(User::new("x", 1.0).into()).await.unwrap();

        let trades = store.query_as::<Trade>(Some(2)).await.unwrap();
        let ids: Vec<_> = trades.iter().map(|s| s.doc.id.clone()).collect();
        assert_eq!(ids, vec![new.id, mid.id]);

        let all = store.all_of::<Trade>().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].id, old.id);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }
}
