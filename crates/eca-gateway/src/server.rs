//! Core server: accepts connections and hands each to the lifecycle controller.
//!
//! Owns the connection registry and the shutdown broadcast. The identity
//! store is injected so the server never reaches for a global handle.

use crate::config::GatewayConfig;
use crate::lifecycle::ConnectionController;
use crate::registry::ConnectionRegistry;
use crate::store::IdentityStore;
use crate::transport::websocket;
use eca_core::EcaResult;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The ECA gateway instance.
pub struct EcaGateway {
    config: GatewayConfig,
    controller: Arc<ConnectionController>,
    registry: ConnectionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl EcaGateway {
    pub fn new(config: GatewayConfig, store: Arc<dyn IdentityStore>) -> Self {
        let registry = ConnectionRegistry::new();
        let shutdown_tx = broadcast::channel(1).0;
        let controller = Arc::new(ConnectionController::new(
            store,
            config.connection.clone(),
            registry.clone(),
        ));

        Self {
            config,
            controller,
            registry,
            shutdown_tx,
        }
    }

    /// Serve until `shutdown` resolves, then drain live connections.
    pub async fn run<F>(self, shutdown: F) -> EcaResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut ws_rx =
            websocket::start_listener(self.config.bind_addr, self.config.path.clone()).await?;

        info!(
            addr = %self.config.bind_addr,
            path = %self.config.path,
            admission = ?self.controller.admission(),
            "eca-gateway ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(ws_conn) = ws_rx.recv() => {
                    let controller = self.controller.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        let report = controller.handle(ws_conn, shutdown_rx).await;
                        match report.rejection {
                            Some(e) => debug!(sid = %report.sid, error = %e, "connection refused"),
                            None => debug!(
                                sid = %report.sid,
                                node = ?report.node.map(|n| n.to_hex()),
                                reason = %report.reason,
                                "connection task finished"
                            ),
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        // Stops the listener; queued and in-flight upgrades are dropped.
        drop(ws_rx);

        // Broadcast shutdown to all connected clients
        let live = self.registry.count().await;
        info!(live, "broadcasting shutdown to connected ECAs");
        let _ = self.shutdown_tx.send(());

        let remaining = self.registry.drain(self.config.shutdown_grace).await;
        if remaining > 0 {
            for conn in self.registry.list().await {
                warn!(
                    sid = %conn.sid,
                    remote = %conn.remote,
                    node = ?conn.node.map(|n| n.to_hex()),
                    connected_secs = conn.connected_secs,
                    "connection still open at exit"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, StoreConfig};
    use crate::store::testing::MemoryStore;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    const KNOWN: &str = "5f1d7a2b9c3e4d5f6a7b8c9d";

    fn test_config(port: u16) -> GatewayConfig {
        GatewayConfig {
            bind_addr: ([127, 0, 0, 1], port).into(),
            path: "/socket.io/".into(),
            shutdown_grace: Duration::from_secs(2),
            store: StoreConfig {
                uri: "mongodb://unused".into(),
                database: "cdnv3".into(),
                collection: "nodes".into(),
                timeout: Duration::from_secs(1),
            },
            connection: ConnectionConfig::default(),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn next_text<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> String
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
                Some(Ok(Message::Text(t))) => return t.as_str().to_string(),
                Some(Ok(_)) => continue,
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn serves_socketio_over_tcp_and_drains_on_shutdown() {
        let port = free_port();
        let store = Arc::new(MemoryStore::new().with_node(KNOWN.parse().unwrap(), true));
        let gateway = EcaGateway::new(test_config(port), store);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(gateway.run(async {
            let _ = stop_rx.await;
        }));

        let url = format!("ws://127.0.0.1:{port}/socket.io/?EIO=4&transport=websocket");
        let request = || {
            let mut request = url.as_str().into_client_request().unwrap();
            request
                .headers_mut()
                .insert("x-packetframe-eca-auth", HeaderValue::from_static(KNOWN));
            request
        };

        // The listener binds inside the spawned task; retry briefly.
        let mut ws = None;
        for _ in 0..50 {
            match tokio_tungstenite::connect_async(request()).await {
                Ok((stream, _)) => {
                    ws = Some(stream);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut ws = ws.expect("gateway did not accept connections");

        assert!(next_text(&mut ws).await.starts_with("0{"));
        ws.send(Message::Text("40".to_string().into())).await.unwrap();
        assert!(next_text(&mut ws).await.starts_with("40"));
        ws.send(Message::Text("42[\"notice\",\"edge\"]".to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "42[\"reply\",\"have edge\"]");

        stop_tx.send(()).unwrap();
        assert_eq!(next_text(&mut ws).await, "1");
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
