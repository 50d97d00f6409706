//! Identity Store: read-only lookups of registered nodes.
//!
//! The production store is a MongoDB collection keyed by `_id` (an ObjectId,
//! i.e. the 12-byte [`NodeId`]). The store is created once at startup and
//! shared by every connection handler.

use crate::config::StoreConfig;
use async_trait::async_trait;
use eca_core::{EcaError, EcaResult, NodeId};
use mongodb::bson::{doc, oid::ObjectId, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use std::future::{Future, IntoFuture};
use std::time::Duration;
use tracing::{debug, info};

/// A registered edge-cache agent.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Set by the provisioning API once an operator approves the node.
    pub authorized: bool,
    /// The full registration document.
    pub document: Document,
}

impl NodeRecord {
    pub fn from_document(id: NodeId, document: Document) -> Self {
        let authorized = document.get_bool("authorized").unwrap_or(false);
        Self {
            id,
            authorized,
            document,
        }
    }
}

/// Lookup seam for the node registry.
///
/// `Ok(None)` means "no such node" and is not an error.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn lookup(&self, id: &NodeId) -> EcaResult<Option<NodeRecord>>;
}

/// Node registry backed by a MongoDB collection.
pub struct MongoIdentityStore {
    nodes: Collection<Document>,
}

impl MongoIdentityStore {
    /// Connect and ping, each bounded by `config.timeout`.
    ///
    /// Either failure means the gateway must not start.
    pub async fn connect(config: &StoreConfig) -> EcaResult<Self> {
        let client = with_timeout(config.timeout, async {
            let mut options = ClientOptions::parse(&config.uri).await?;
            options.connect_timeout = Some(config.timeout);
            options.server_selection_timeout = Some(config.timeout);
            Client::with_options(options)
        })
        .await?;

        let admin = client.database("admin");
        with_timeout(
            config.timeout,
            admin.run_command(doc! { "ping": 1 }).into_future(),
        )
        .await?;

        info!(
            database = %config.database,
            collection = %config.collection,
            "connected to database"
        );

        Ok(Self {
            nodes: client
                .database(&config.database)
                .collection::<Document>(&config.collection),
        })
    }
}

#[async_trait]
impl IdentityStore for MongoIdentityStore {
    async fn lookup(&self, id: &NodeId) -> EcaResult<Option<NodeRecord>> {
        let oid = ObjectId::from_bytes(id.bytes());
        let found = self
            .nodes
            .find_one(doc! { "_id": oid })
            .await
            .map_err(|e| EcaError::StoreUnavailable(e.to_string()))?;
        debug!(node = %id, found = found.is_some(), "node lookup");
        Ok(found.map(|document| NodeRecord::from_document(*id, document)))
    }
}

/// Run a driver future under a deadline, mapping both failure modes.
async fn with_timeout<T, F>(budget: Duration, fut: F) -> EcaResult<T>
where
    F: Future<Output = mongodb::error::Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EcaError::StoreUnavailable(e.to_string())),
        Err(_) => Err(EcaError::Timeout),
    }
}

/// In-memory store double for tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MemoryStore {
        records: HashMap<NodeId, NodeRecord>,
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_node(mut self, id: NodeId, authorized: bool) -> Self {
            let document = doc! { "_id": ObjectId::from_bytes(id.bytes()), "authorized": authorized };
            self.records
                .insert(id, NodeRecord::from_document(id, document));
            self
        }

        /// Every lookup fails as if the database were unreachable.
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        /// Every lookup stalls for `delay` before answering.
        pub fn stalled(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityStore for MemoryStore {
        async fn lookup(&self, id: &NodeId) -> EcaResult<Option<NodeRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(EcaError::StoreUnavailable("connection refused".into()));
            }
            Ok(self.records.get(id).cloned())
        }
    }
}
