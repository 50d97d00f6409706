//! Registry of live ECA connections.
//!
//! Tracks who is connected for logging and for draining on shutdown. The
//! registry never holds session state; that stays inside each connection.

use eca_core::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// One live connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub sid: String,
    pub remote: SocketAddr,
    pub node: Option<NodeId>,
    pub connected_at: Instant,
}

/// Snapshot returned when listing connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub sid: String,
    pub remote: SocketAddr,
    pub node: Option<NodeId>,
    pub connected_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admitted connection. Returns the live count afterwards.
    pub async fn register(&self, sid: &str, remote: SocketAddr, node: Option<NodeId>) -> usize {
        let mut connections = self.connections.write().await;
        connections.insert(
            sid.to_string(),
            ConnectionEntry {
                sid: sid.to_string(),
                remote,
                node,
                connected_at: Instant::now(),
            },
        );
        connections.len()
    }

    /// Remove a connection. Returns how long it was registered.
    pub async fn unregister(&self, sid: &str) -> Option<Duration> {
        let removed = self.connections.write().await.remove(sid);
        if removed.is_none() {
            debug!(sid, "unregister of unknown connection");
        }
        removed.map(|entry| entry.connected_at.elapsed())
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().await;
        let mut list: Vec<ConnectionInfo> = connections
            .values()
            .map(|c| ConnectionInfo {
                sid: c.sid.clone(),
                remote: c.remote,
                node: c.node,
                connected_secs: c.connected_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.sid.cmp(&b.sid));
        list
    }

    /// Wait until every connection has unregistered, or `grace` elapses.
    ///
    /// Returns the number still connected.
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.count().await;
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let node = NodeId::from_bytes([1; 12]);
        assert_eq!(registry.register("a", addr(1000), Some(node)).await, 1);
        assert_eq!(registry.register("b", addr(1001), None).await, 2);

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].sid, "a");
        assert_eq!(list[0].node, Some(node));
        assert_eq!(list[1].remote, addr(1001));

        assert!(registry.unregister("a").await.is_some());
        assert!(registry.unregister("a").await.is_none());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn drain_returns_when_empty() {
        let registry = ConnectionRegistry::new();
        registry.register("a", addr(1000), None).await;

        let r = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            r.unregister("a").await;
        });

        assert_eq!(registry.drain(Duration::from_secs(2)).await, 0);
    }

    #[tokio::test]
    async fn drain_gives_up_after_grace() {
        let registry = ConnectionRegistry::new();
        registry.register("stuck", addr(1000), None).await;
        assert_eq!(registry.drain(Duration::from_millis(50)).await, 1);
    }
}
