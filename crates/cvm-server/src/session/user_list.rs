//! Membership set for one VM controller.

use crate::session::User;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Insertion-ordered, deduplicated list of users with its own lock.
#[derive(Default)]
pub struct UserList {
    users: Mutex<Vec<Arc<User>>>,
}

impl UserList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `user` unless a user with the same session is already present.
    pub fn add(&self, user: &Arc<User>) -> bool {
        let mut users = self.users.lock();
        if users.iter().any(|u| u.id() == user.id()) {
            return false;
        }
        users.push(user.clone());
        true
    }

    pub fn remove(&self, user: &User) -> bool {
        let mut users = self.users.lock();
        match users.iter().position(|u| u.id() == user.id()) {
            Some(i) => {
                users.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, user: &User) -> bool {
        self.users.lock().iter().any(|u| u.id() == user.id())
    }

    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }

    /// Visit a snapshot of the members. The lock is not held while visiting.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<User>) -> ControlFlow<()>) {
        let snapshot = self.users.lock().clone();
        for user in &snapshot {
            if visit(user).is_break() {
                break;
            }
        }
    }

    /// Visit the members while holding the lock, excluding concurrent add/remove.
    /// `visit` must not call back into this list.
    pub fn for_each_locked(&self, mut visit: impl FnMut(&Arc<User>) -> ControlFlow<()>) {
        let users = self.users.lock();
        for user in users.iter() {
            if visit(user).is_break() {
                break;
            }
        }
    }
}
