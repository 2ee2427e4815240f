//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, runs the optional TLS handshake, then the
//! WebSocket upgrade. The upgrade request's path, query string and token
//! header are captured so the server can route and authenticate before any
//! frame is exchanged.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termhub_core::{ServerMessage, TermhubError, TermhubResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Header carrying the long-lived token.
pub const TOKEN_HEADER: &str = "x-token";

/// How long to wait for the peer to acknowledge a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Any byte stream a WebSocket can run over.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type WsStream = WebSocketStream<Box<dyn IoStream>>;

/// The parts of the HTTP upgrade request the server cares about.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    pub token_header: Option<String>,
}

impl UpgradeRequest {
    fn from_http(req: &Request) -> Self {
        let query = req
            .uri()
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let token_header = req
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self {
            path: req.uri().path().to_string(),
            query,
            token_header,
        }
    }

    /// A non-empty query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
    pub request: UpgradeRequest,
}

/// A bound listener and the stream of connections it accepts.
pub struct Listener {
    pub local_addr: SocketAddr,
    pub incoming: mpsc::Receiver<WebSocketConnection>,
}

/// Bind `bind_addr` and start accepting in the background.
///
/// With `tls` set, every connection must complete a TLS handshake first.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> TermhubResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TermhubError::Transport(format!("WS bind failed on {bind_addr}: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;
    let acceptor = tls.map(TlsAcceptor::from);

    info!(addr = %local_addr, tls = acceptor.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let io: Box<dyn IoStream> = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(e) => {
                                    warn!(remote = %addr, error = %e, "TLS handshake failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };

                        let mut request = UpgradeRequest::default();
                        let upgraded = tokio_tungstenite::accept_hdr_async(
                            io,
                            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                                request = UpgradeRequest::from_http(req);
                                Ok(resp)
                            },
                        )
                        .await;

                        match upgraded {
                            Ok(ws_stream) => {
                                debug!(
                                    remote = %addr,
                                    path = %request.path,
                                    "WebSocket connection accepted"
                                );
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                    request,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
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

    Ok(Listener {
        local_addr,
        incoming: rx,
    })
}

/// Send one JSON message as a text frame.
pub async fn send_message(ws: &mut WsStream, msg: &ServerMessage) -> TermhubResult<()> {
    let json = msg.to_json()?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| TermhubError::Transport(format!("WS send failed: {e}")))
}

/// Close the connection with `code`, then wait briefly for the peer's reply.
pub async fn close_with(ws: &mut WsStream, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!(code, error = %e, "close frame not delivered");
        return;
    }
    let drained = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
    if drained.is_err() {
        debug!(code, "peer did not finish the close handshake");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    #[tokio::test]
    async fn captures_path_query_and_token_header() {
        let mut listener = start_listener("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let url = format!(
            "ws://{}/terminal/abc?key=k1&command=ls%20-la&empty=",
            listener.local_addr
        );
        let mut req = url.into_client_request().unwrap();
        req.headers_mut().insert("X-Token", "secret".parse().unwrap());

        let client = tokio::spawn(tokio_tungstenite::connect_async(req));
        let conn = listener.incoming.recv().await.unwrap();

        assert_eq!(conn.request.path, "/terminal/abc");
        assert_eq!(conn.request.param("key"), Some("k1"));
        assert_eq!(conn.request.param("command"), Some("ls -la"));
        assert_eq!(conn.request.param("empty"), None);
        assert_eq!(conn.request.token_header.as_deref(), Some("secret"));
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_code_reaches_client() {
        let mut listener = start_listener("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let url = format!("ws://{}/anything", listener.local_addr);
        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => continue,
                    _ => return None,
                }
            }
        });

        let mut conn = listener.incoming.recv().await.unwrap();
        close_with(&mut conn.ws_stream, 4004, "nope").await;
        assert_eq!(client.await.unwrap(), Some(4004));
    }
}
