//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts Engine.IO WebSocket upgrades under the configured path prefix and
//! captures the upgrade request headers for authentication. HTTP
//! long-polling is not served.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use eca_core::engineio::ENGINE_PROTOCOL;
use eca_core::{EcaError, EcaResult};

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection<S = TcpStream> {
    pub ws_stream: WebSocketStream<S>,
    pub remote_addr: SocketAddr,
    /// Headers of the HTTP upgrade request.
    pub headers: HeaderMap,
}

/// Next inbound frame, reduced to what the connection loop cares about.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    /// A frame the gateway does not accept (binary, oversized).
    Rejected(String),
    Closed,
}

/// Start the WebSocket listener.
///
/// Returns a receiver that yields accepted connections. Dropping the
/// receiver stops the listener and releases the port.
pub async fn start_listener(
    bind_addr: SocketAddr,
    path: String,
) -> EcaResult<mpsc::Receiver<WebSocketConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| EcaError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %bind_addr, path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => {
                    debug!("WebSocket listener stopped");
                    break;
                }
                accepted = tcp_listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        match accept(stream, &path).await {
                            Ok((ws_stream, headers)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    headers,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!(remote = %addr, "gateway stopping, upgrade dropped");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(rx)
}

/// Run the upgrade, rejecting requests outside the Engine.IO endpoint.
async fn accept<S>(stream: S, path: &str) -> EcaResult<(WebSocketStream<S>, HeaderMap)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut captured = HeaderMap::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Err((status, reason)) = check_upgrade_uri(req.uri(), path) {
                let mut rejection = ErrorResponse::new(Some(reason.to_string()));
                *rejection.status_mut() = status;
                return Err(rejection);
            }
            captured = req.headers().clone();
            Ok(resp)
        },
    )
    .await
    .map_err(|e| EcaError::Transport(format!("WS upgrade failed: {e}")))?;

    Ok((ws_stream, captured))
}

/// Only `<path>?EIO=4&transport=websocket` is served.
pub fn check_upgrade_uri(uri: &Uri, path: &str) -> Result<(), (StatusCode, &'static str)> {
    let request_path = uri.path();
    let prefix = path.trim_end_matches('/');
    if request_path != prefix && !request_path.starts_with(path) {
        return Err((StatusCode::NOT_FOUND, "not found"));
    }

    let mut eio = None;
    let mut transport = None;
    for pair in uri.query().unwrap_or_default().split('&') {
        match pair.split_once('=') {
            Some(("EIO", v)) => eio = Some(v),
            Some(("transport", v)) => transport = Some(v),
            _ => {}
        }
    }

    if eio != Some(ENGINE_PROTOCOL) {
        return Err((StatusCode::BAD_REQUEST, "unsupported protocol version"));
    }
    if transport != Some("websocket") {
        return Err((StatusCode::BAD_REQUEST, "transport unknown"));
    }
    Ok(())
}

/// Helper: send a text frame.
pub async fn ws_send_text<S>(ws: &mut WebSocketStream<S>, text: String) -> EcaResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| EcaError::Transport(format!("WS send failed: {e}")))
}

/// Helper: receive the next text frame.
///
/// Control frames are skipped; tungstenite answers pings on the next write.
pub async fn ws_recv_text<S>(
    ws: &mut WebSocketStream<S>,
    max_payload: usize,
) -> EcaResult<Inbound>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_payload {
                    return Ok(Inbound::Rejected(format!(
                        "frame too large: {} bytes (max {max_payload})",
                        text.len()
                    )));
                }
                return Ok(Inbound::Text(text.as_str().to_string()));
            }
            Some(Ok(Message::Binary(data))) => {
                return Ok(Inbound::Rejected(format!(
                    "binary frame of {} bytes not supported",
                    data.len()
                )));
            }
            Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(EcaError::Transport(format!("WS recv failed: {e}")));
            }
        }
    }
}

/// Helper: close the socket, ignoring a peer that is already gone.
pub async fn ws_close<S>(ws: &mut WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = ws.close(None).await {
        debug!(error = %e, "WS close on dead socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn accepts_engineio_websocket_upgrade() {
        assert!(check_upgrade_uri(&uri("/socket.io/?EIO=4&transport=websocket"), "/socket.io/").is_ok());
        assert!(check_upgrade_uri(&uri("/socket.io?transport=websocket&EIO=4&t=abc"), "/socket.io/").is_ok());
    }

    #[test]
    fn rejects_other_paths() {
        let err = check_upgrade_uri(&uri("/other/?EIO=4&transport=websocket"), "/socket.io/").unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn rejects_wrong_protocol_or_transport() {
        let err = check_upgrade_uri(&uri("/socket.io/?EIO=3&transport=websocket"), "/socket.io/").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        let err = check_upgrade_uri(&uri("/socket.io/?EIO=4&transport=polling"), "/socket.io/").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(check_upgrade_uri(&uri("/socket.io/"), "/socket.io/").is_err());
    }

    #[tokio::test]
    async fn upgrade_captures_headers() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { accept(server_io, "/socket.io/").await });

        let mut request = "ws://localhost/socket.io/?EIO=4&transport=websocket"
            .into_client_request()
            .unwrap();
        request.headers_mut().insert(
            "x-packetframe-eca-auth",
            HeaderValue::from_static("5f1d7a2b9c3e4d5f6a7b8c9d"),
        );
        let (_client, _resp) = tokio_tungstenite::client_async(request, client_io).await.unwrap();

        let (_ws, headers) = server.await.unwrap().unwrap();
        assert_eq!(
            headers.get("X-Packetframe-Eca-Auth").unwrap(),
            "5f1d7a2b9c3e4d5f6a7b8c9d"
        );
    }

    #[tokio::test]
    async fn upgrade_outside_endpoint_is_refused() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { accept(server_io, "/socket.io/").await });

        let request = "ws://localhost/elsewhere".into_client_request().unwrap();
        assert!(tokio_tungstenite::client_async(request, client_io).await.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn dropping_receiver_releases_listener() {
        let addr: SocketAddr = {
            let reserve = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserve.local_addr().unwrap()
        };
        let rx = start_listener(addr, "/socket.io/".into()).await.unwrap();
        assert!(TcpListener::bind(addr).await.is_err());

        drop(rx);
        let mut rebound = false;
        for _ in 0..100 {
            if TcpListener::bind(addr).await.is_ok() {
                rebound = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(rebound, "listener still holds {addr}");
    }
}
