//! Single-consumer work queue. All user, session and IP membership changes
//! are applied by one worker thread in submission order.

pub mod queue;
pub mod worker;

pub use queue::WorkQueue;
pub use worker::Worker;

use crate::session::Session;
use std::sync::Arc;

/// A unit of session-lifecycle or message work.
pub enum WorkItem {
    AddConnection(Arc<Session>),
    RemoveConnection(Arc<Session>),
    /// Raw binary frame from a session, decoded by the worker.
    Message(Arc<Session>, Vec<u8>),
}

impl WorkItem {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::AddConnection(s) | Self::RemoveConnection(s) | Self::Message(s, _) => s,
        }
    }
}
