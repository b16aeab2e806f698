//! Connection handler bridging the transport to the work queue.
//!
//! Verification runs on the transport's I/O task and only touches the IP
//! data registry. Everything else is handed to the worker thread in arrival
//! order.

use crate::ip_data::IpRegistry;
use crate::session::Session;
use crate::transport::ConnectionHandler;
use crate::work::{WorkItem, WorkQueue};
use cvm_core::SUBPROTOCOL;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub struct Server {
    queue: Arc<WorkQueue>,
    registry: Arc<IpRegistry>,
}

impl Server {
    pub fn new(queue: Arc<WorkQueue>, registry: Arc<IpRegistry>) -> Self {
        Self { queue, registry }
    }

    fn enqueue(&self, item: WorkItem) {
        let session = item.session().id();
        if !self.queue.push(item) {
            debug!(session, "work queue stopped, item dropped");
        }
    }
}

impl ConnectionHandler for Server {
    fn verify(&self, remote: SocketAddr, subprotocols: &[&str]) -> Option<String> {
        if !subprotocols.contains(&SUBPROTOCOL) {
            return None;
        }
        let count = self.registry.acquire(remote.ip());
        debug!(ip = %remote.ip(), connections = count, "connection verified");
        Some(SUBPROTOCOL.to_string())
    }

    fn abandon(&self, remote: SocketAddr) {
        self.registry.release(remote.ip());
    }

    fn open(&self, session: Arc<Session>) {
        self.enqueue(WorkItem::AddConnection(session));
    }

    fn message(&self, session: &Arc<Session>, payload: Vec<u8>) {
        self.enqueue(WorkItem::Message(session.clone(), payload));
    }

    fn close(&self, session: &Arc<Session>) {
        self.enqueue(WorkItem::RemoveConnection(session.clone()));
    }
}
