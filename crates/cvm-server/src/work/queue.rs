use crate::work::WorkItem;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState {
    items: VecDeque<WorkItem>,
    stopped: bool,
}

/// FIFO guarded by one mutex and a not-empty condition.
///
/// Producers never wait; `pop` blocks the single consumer until an item
/// arrives or the queue is stopped.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue an item. Returns false once the queue has been stopped.
    pub fn push(&self, item: WorkItem) -> bool {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return false;
            }
            state.items.push_back(item);
        }
        self.ready.notify_one();
        true
    }

    /// Block until an item is available. `None` means the queue was stopped.
    pub fn pop(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Stop the queue and release pending items unprocessed.
    /// Returns how many were dropped.
    pub fn stop(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.stopped = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.ready.notify_all();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}
