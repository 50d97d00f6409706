//! Connection Lifecycle Controller.
//!
//! Drives one ECA connection from upgrade to teardown:
//!
//! ```text
//! Connecting → Authenticating → Open → Closing → Closed
//!                    └──────────(rejected)──────────┘
//! ```
//!
//! Each connection runs on its own task and owns its [`SessionState`], so
//! events for a connection are handled one at a time and in arrival order
//! without any locking.

use crate::auth::{self, AdmissionPolicy};
use crate::config::ConnectionConfig;
use crate::registry::ConnectionRegistry;
use crate::router::{self, Namespace};
use crate::session::SessionState;
use crate::store::IdentityStore;
use crate::transport::websocket::{self, Inbound, WebSocketConnection};
use eca_core::{EcaError, EcaResult, EnginePacket, NodeId, OpenPayload, Packet, PacketKind};
use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl ConnectionPhase {
    pub fn can_advance(self, to: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, to),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Open)
                | (Authenticating, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}

/// Phase tracker for one connection.
#[derive(Debug)]
pub struct Lifecycle {
    sid: String,
    phase: ConnectionPhase,
}

impl Lifecycle {
    pub fn new(sid: &str) -> Self {
        Self {
            sid: sid.to_string(),
            phase: ConnectionPhase::Connecting,
        }
    }

    pub fn advance(&mut self, to: ConnectionPhase) -> EcaResult<()> {
        if !self.phase.can_advance(to) {
            return Err(EcaError::Other(format!(
                "illegal connection transition {:?} -> {to:?}",
                self.phase
            )));
        }
        debug!(sid = %self.sid, from = ?self.phase, to = ?to, "connection phase");
        self.phase = to;
        Ok(())
    }

    fn enter(&mut self, to: ConnectionPhase) {
        if let Err(e) = self.advance(to) {
            error!(sid = %self.sid, error = %e, "lifecycle violation");
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthenticationRejected,
    /// The client left the root namespace.
    ClientNamespaceDisconnect,
    /// A handler closed the connection (`bye`).
    ServerNamespaceDisconnect,
    TransportClose,
    TransportError,
    PingTimeout,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::AuthenticationRejected => "authentication rejected",
            DisconnectReason::ClientNamespaceDisconnect => "client namespace disconnect",
            DisconnectReason::ServerNamespaceDisconnect => "server namespace disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ServerShutdown => "server shutting down",
        }
    }

    /// Whether the server ends the session and owes the client a `close`.
    fn server_initiated(self) -> bool {
        matches!(
            self,
            DisconnectReason::ServerNamespaceDisconnect
                | DisconnectReason::PingTimeout
                | DisconnectReason::ServerShutdown
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished connection.
#[derive(Debug)]
pub struct ConnectionReport {
    pub sid: String,
    pub node: Option<NodeId>,
    /// Why admission was refused, if it was.
    pub rejection: Option<EcaError>,
    pub reason: DisconnectReason,
}

/// Runs connections against an injected identity store.
pub struct ConnectionController {
    store: Arc<dyn IdentityStore>,
    config: ConnectionConfig,
    registry: ConnectionRegistry,
}

impl ConnectionController {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        config: ConnectionConfig,
        registry: ConnectionRegistry,
    ) -> Self {
        Self {
            store,
            config,
            registry,
        }
    }

    pub fn admission(&self) -> AdmissionPolicy {
        self.config.admission
    }

    /// Serve one connection until it closes or `shutdown_rx` fires.
    ///
    /// The receiver must be subscribed before the connection is handed off,
    /// so a shutdown broadcast between accept and here is not missed.
    pub async fn handle<S>(
        &self,
        conn: WebSocketConnection<S>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> ConnectionReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let WebSocketConnection {
            mut ws_stream,
            remote_addr,
            headers,
        } = conn;
        let sid = generate_sid();
        let mut lifecycle = Lifecycle::new(&sid);

        info!(sid = %sid, remote = %remote_addr, "ECA connected");
        debug!(sid = %sid, headers = ?headers, "upgrade headers");

        lifecycle.enter(ConnectionPhase::Authenticating);
        let outcome = auth::authenticate(
            &headers,
            &self.config.auth_header,
            self.store.as_ref(),
            self.config.lookup_timeout,
        )
        .await;

        let record = match auth::admit(outcome, self.config.admission) {
            Ok(record) => record,
            Err(e) => {
                warn!(sid = %sid, remote = %remote_addr, error = %e, "rejecting ECA connection");
                ws_close_quietly(&mut ws_stream).await;
                lifecycle.enter(ConnectionPhase::Closed);
                return ConnectionReport {
                    sid,
                    node: None,
                    rejection: Some(e),
                    reason: DisconnectReason::AuthenticationRejected,
                };
            }
        };
        let node = record.map(|r| r.id);

        lifecycle.enter(ConnectionPhase::Open);
        let live_count = self.registry.register(&sid, remote_addr, node).await;
        info!(sid = %sid, node = ?node.map(|n| n.to_hex()), live = live_count, "ECA session open");

        let mut live = LiveConnection {
            sid: sid.clone(),
            ws: ws_stream,
            state: SessionState::default(),
            joined: HashSet::new(),
            pong_deadline: None,
        };

        let open = EnginePacket::Open(OpenPayload {
            sid: sid.clone(),
            upgrades: Vec::new(),
            ping_interval: self.config.ping_interval.as_millis() as u64,
            ping_timeout: self.config.ping_timeout.as_millis() as u64,
            max_payload: self.config.max_payload,
        });
        let reason = match live.send_engine(open).await {
            Ok(()) => live.run(&self.config, &mut shutdown_rx).await,
            Err(e) => {
                warn!(sid = %sid, error = %e, "meet error");
                DisconnectReason::TransportError
            }
        };

        lifecycle.enter(ConnectionPhase::Closing);
        if reason.server_initiated() {
            if let Err(e) = live.send_engine(EnginePacket::Close).await {
                debug!(sid = %sid, error = %e, "close packet not delivered");
            }
        }
        ws_close_quietly(&mut live.ws).await;
        drop(live);
        lifecycle.enter(ConnectionPhase::Closed);

        let held = self.registry.unregister(&sid).await;
        info!(
            sid = %sid,
            reason = %reason,
            held_secs = held.map(|d| d.as_secs()).unwrap_or_default(),
            "closed"
        );

        ConnectionReport {
            sid,
            node,
            rejection: None,
            reason,
        }
    }
}

/// An admitted connection and everything it owns.
struct LiveConnection<S> {
    sid: String,
    ws: WebSocketStream<S>,
    state: SessionState,
    joined: HashSet<Namespace>,
    pong_deadline: Option<Instant>,
}

impl<S> LiveConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(
        &mut self,
        config: &ConnectionConfig,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> DisconnectReason {
        let mut ping = tokio::time::interval_at(
            Instant::now() + config.ping_interval,
            config.ping_interval,
        );

        loop {
            let deadline = self.pong_deadline;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(sid = %self.sid, "shutdown signal received");
                    return DisconnectReason::ServerShutdown;
                }

                _ = ping.tick() => {
                    if let Err(e) = self.send_engine(EnginePacket::Ping(None)).await {
                        warn!(sid = %self.sid, error = %e, "meet error");
                        return DisconnectReason::TransportError;
                    }
                    if self.pong_deadline.is_none() {
                        self.pong_deadline = Some(Instant::now() + config.ping_timeout);
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return DisconnectReason::PingTimeout;
                }

                inbound = websocket::ws_recv_text(&mut self.ws, config.max_payload) => {
                    match inbound {
                        Ok(Inbound::Text(frame)) => {
                            if let ControlFlow::Break(reason) = self.on_frame(&frame).await {
                                return reason;
                            }
                        }
                        Ok(Inbound::Rejected(why)) => {
                            warn!(sid = %self.sid, error = %why, "meet error");
                        }
                        Ok(Inbound::Closed) => return DisconnectReason::TransportClose,
                        Err(e) => {
                            warn!(sid = %self.sid, error = %e, "meet error");
                            return DisconnectReason::TransportError;
                        }
                    }
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: &str) -> ControlFlow<DisconnectReason> {
        let packet = match EnginePacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(sid = %self.sid, error = %e, "meet error");
                return ControlFlow::Continue(());
            }
        };

        match packet {
            EnginePacket::Pong(_) => self.pong_deadline = None,
            EnginePacket::Ping(data) => return self.deliver_engine(EnginePacket::Pong(data)).await,
            EnginePacket::Message(payload) => return self.on_packet(&payload).await,
            EnginePacket::Close => return ControlFlow::Break(DisconnectReason::TransportClose),
            EnginePacket::Upgrade | EnginePacket::Noop => {}
            EnginePacket::Open(_) => {
                warn!(sid = %self.sid, "meet error: client sent an open packet");
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_packet(&mut self, payload: &str) -> ControlFlow<DisconnectReason> {
        let packet = match Packet::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(sid = %self.sid, error = %e, "meet error");
                return ControlFlow::Continue(());
            }
        };

        let Some(nsp) = Namespace::parse(&packet.nsp) else {
            if packet.kind == PacketKind::Connect {
                debug!(sid = %self.sid, nsp = %packet.nsp, "connect to unknown namespace");
                return self
                    .deliver(Packet::connect_error(&packet.nsp, "Invalid namespace"))
                    .await;
            }
            debug!(sid = %self.sid, nsp = %packet.nsp, "packet for unknown namespace dropped");
            return ControlFlow::Continue(());
        };

        match packet.kind {
            PacketKind::Connect => {
                self.joined.insert(nsp);
                debug!(sid = %self.sid, nsp = nsp.as_str(), "namespace joined");
                return self.deliver(Packet::connect(nsp.as_str(), &generate_sid())).await;
            }
            PacketKind::Disconnect => {
                self.joined.remove(&nsp);
                if nsp == Namespace::Root {
                    return ControlFlow::Break(DisconnectReason::ClientNamespaceDisconnect);
                }
                debug!(sid = %self.sid, nsp = nsp.as_str(), "namespace left");
            }
            PacketKind::Event => {
                if !self.joined.contains(&nsp) {
                    debug!(sid = %self.sid, nsp = nsp.as_str(), "event for unjoined namespace dropped");
                    return ControlFlow::Continue(());
                }
                let (event, args) = match packet.event_parts() {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!(sid = %self.sid, error = %e, "meet error");
                        return ControlFlow::Continue(());
                    }
                };
                match router::route(nsp, event, args, packet.id, &mut self.state) {
                    Ok(dispatch) => {
                        for out in dispatch.outbound {
                            self.deliver(out).await?;
                        }
                        if dispatch.close {
                            return ControlFlow::Break(DisconnectReason::ServerNamespaceDisconnect);
                        }
                    }
                    Err(e) => {
                        warn!(sid = %self.sid, nsp = nsp.as_str(), event, error = %e, "meet error");
                    }
                }
            }
            PacketKind::Ack => {
                debug!(sid = %self.sid, id = ?packet.id, "client ack ignored");
            }
            PacketKind::ConnectError => {
                warn!(sid = %self.sid, "meet error: client sent CONNECT_ERROR");
            }
        }
        ControlFlow::Continue(())
    }

    async fn send_engine(&mut self, packet: EnginePacket) -> EcaResult<()> {
        let frame = packet.encode()?;
        websocket::ws_send_text(&mut self.ws, frame).await
    }

    /// Send, turning a dead transport into a disconnect.
    async fn deliver_engine(&mut self, packet: EnginePacket) -> ControlFlow<DisconnectReason> {
        match self.send_engine(packet).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                warn!(sid = %self.sid, error = %e, "meet error");
                ControlFlow::Break(DisconnectReason::TransportError)
            }
        }
    }

    async fn deliver(&mut self, packet: Packet) -> ControlFlow<DisconnectReason> {
        match packet.encode() {
            Ok(payload) => self.deliver_engine(EnginePacket::Message(payload)).await,
            Err(e) => {
                error!(sid = %self.sid, error = %e, "failed to encode packet");
                ControlFlow::Continue(())
            }
        }
    }
}

async fn ws_close_quietly<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if tokio::time::timeout(Duration::from_secs(1), websocket::ws_close(ws))
        .await
        .is_err()
    {
        debug!("WS close timed out");
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_sid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
