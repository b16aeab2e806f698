//! Sessions: one per upgraded transport connection, plus the user state
//! layered on top of them.

pub mod user;
pub mod user_list;

pub use user::User;
pub use user_list::UserList;

use cvm_core::{cbor_encode, Message};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Transport-level link after a successful upgrade.
///
/// The transport task owns the socket; everything else talks to it through
/// the bounded outbound queue and the close signal.
pub struct Session {
    id: u64,
    remote: SocketAddr,
    subprotocol: String,
    closed: AtomicBool,
    close_notify: Notify,
    tx: mpsc::Sender<Arc<[u8]>>,
}

impl Session {
    pub fn new(remote: SocketAddr, subprotocol: String, tx: mpsc::Sender<Arc<[u8]>>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            subprotocol,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an encoded frame. A full or closed queue closes the session.
    pub fn send(&self, payload: Arc<[u8]>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = self.id, remote = %self.remote, "outbound queue full, closing");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                false
            }
        }
    }

    /// Encode and queue a single message.
    pub fn send_message(&self, msg: &Message) -> bool {
        match cbor_encode(msg) {
            Ok(bytes) => self.send(bytes.into()),
            Err(e) => {
                debug!(session = self.id, kind = msg.kind(), error = %e, "encode failed");
                false
            }
        }
    }

    /// Request the transport to close. Returns true only for the first call.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.close_notify.notify_waiters();
        true
    }

    /// Resolves once `close` has been called. Any number of waiters may be
    /// pending at once.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// A detached session whose outbound frames land in the returned receiver.
    #[cfg(test)]
    pub fn test_pair(remote: &str) -> (Arc<Session>, mpsc::Receiver<Arc<[u8]>>) {
        let (tx, rx) = mpsc::channel(crate::transport::websocket::OUTBOUND_QUEUE);
        let addr = remote.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
        (Arc::new(Session::new(addr, cvm_core::SUBPROTOCOL.into(), tx)), rx)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
