//! Transport layer: accepts connections and reports session lifecycle to a
//! [`ConnectionHandler`]. The handler never touches sockets directly.

pub mod http;
pub mod websocket;

use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;

/// Capability interface the transport drives for every connection.
///
/// All methods are called from I/O tasks and must not block.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Decide whether to accept an upgrade offering `subprotocols`.
    /// Returns the subprotocol to echo, or `None` to reject.
    fn verify(&self, remote: SocketAddr, subprotocols: &[&str]) -> Option<String>;

    /// The upgrade failed after `verify` accepted it.
    fn abandon(&self, _remote: SocketAddr) {}

    /// A verified session finished its handshake.
    fn open(&self, session: Arc<Session>);

    /// One binary frame from the peer.
    fn message(&self, session: &Arc<Session>, payload: Vec<u8>);

    /// The session is gone. Called exactly once per opened session.
    fn close(&self, session: &Arc<Session>);
}
