//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted TCP connection is first peeked: plain HTTP requests get a
//! canned answer, upgrade requests go through the handshake with the
//! handler's verification gate. An accepted session then runs one task that
//! forwards inbound binary frames to the handler and drains the session's
//! outbound queue.

use crate::session::Session;
use crate::transport::http::{self, RequestKind};
use crate::transport::ConnectionHandler;
use cvm_core::{CvmError, CvmResult};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info};

/// Maximum size of an inbound WebSocket message or frame (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Outbound frames buffered per session before it is considered too slow.
pub const OUTBOUND_QUEUE: usize = 256;

/// Time allowed for the client to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the closing handshake frame to be written.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A running listener.
pub struct Listener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections. Established sessions are unaffected.
    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Bind and start accepting connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
) -> CvmResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CvmError::Transport(format!("bind {bind_addr} failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let task = tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, remote)) => {
                    let handler = handler.clone();
                    tokio::spawn(handle_connection(stream, remote, handler));
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok(Listener { local_addr, task })
}

async fn handle_connection(stream: TcpStream, remote: SocketAddr, handler: Arc<dyn ConnectionHandler>) {
    match tokio::time::timeout(HEAD_TIMEOUT, http::peek_request(&stream)).await {
        Err(_) => {
            debug!(remote = %remote, "request head timed out");
            return;
        }
        Ok(Err(e)) => {
            debug!(remote = %remote, error = %e, "reading request head failed");
            return;
        }
        Ok(Ok(None)) => {
            debug!(remote = %remote, "connection closed or head too large");
            return;
        }
        Ok(Ok(Some(RequestKind::Upgrade))) => {}
        Ok(Ok(Some(kind))) => {
            if let Err(e) = http::respond(stream, kind).await {
                debug!(remote = %remote, error = %e, "HTTP response failed");
            }
            return;
        }
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!(remote = %remote, error = %e, "set_nodelay failed");
    }
    let accepted: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let callback = {
        let handler = handler.clone();
        let accepted = accepted.clone();
        move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            let offered: Vec<&str> = req
                .headers()
                .get_all(SEC_WEBSOCKET_PROTOCOL)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();

            let chosen = handler
                .verify(remote, &offered)
                .and_then(|p| HeaderValue::from_str(&p).ok().map(|v| (p, v)));
            match chosen {
                Some((protocol, value)) => {
                    resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    *accepted.lock() = Some(protocol);
                    Ok(resp)
                }
                None => {
                    debug!(remote = %remote, offered = ?offered, "upgrade rejected");
                    let mut err = ErrorResponse::new(Some("unsupported subprotocol".into()));
                    *err.status_mut() = StatusCode::BAD_REQUEST;
                    Err(err)
                }
            }
        }
    };

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config))
        .await
    {
        Ok(ws) => ws,
        Err(e) => {
            if accepted.lock().take().is_some() {
                handler.abandon(remote);
            }
            debug!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let subprotocol = accepted.lock().take().unwrap_or_default();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let session = Arc::new(Session::new(remote, subprotocol, tx));
    debug!(remote = %remote, session = session.id(), "WebSocket session opened");

    handler.open(session.clone());
    run_session(ws, &session, rx, handler.as_ref()).await;
    session.close();
    handler.close(&session);
    debug!(remote = %remote, session = session.id(), "WebSocket session closed");
}

async fn run_session(
    ws: WebSocketStream<TcpStream>,
    session: &Arc<Session>,
    mut rx: mpsc::Receiver<Arc<[u8]>>,
    handler: &dyn ConnectionHandler,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = session.closed() => {
                let close = sink.send(WsMessage::Close(None));
                if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                    debug!(session = session.id(), "close frame timed out");
                }
                break;
            }

            Some(payload) = rx.recv() => {
                // A peer that stopped reading blocks the write; closing the
                // session must still end the task.
                tokio::select! {
                    sent = sink.send(WsMessage::Binary(payload.to_vec().into())) => {
                        if let Err(e) = sent {
                            debug!(session = session.id(), error = %e, "WebSocket send failed");
                            break;
                        }
                    }
                    _ = session.closed() => {
                        debug!(session = session.id(), "closed while a write was pending");
                        break;
                    }
                }
            }

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Binary(data))) => handler.message(session, data.into()),
                Some(Ok(WsMessage::Close(_))) | None => break,
                // Text frames are not part of the protocol; pings are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = session.id(), error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }
}
