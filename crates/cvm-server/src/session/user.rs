use crate::session::Session;
use crate::vm::VmController;
use cvm_core::{Message, Role};
use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::{Arc, Weak};

/// A registered viewer.
///
/// The worker thread owns the map of users; VM controllers only hold
/// references for broadcasting, so the name is readable from their threads.
pub struct User {
    session: Arc<Session>,
    address: IpAddr,
    name: RwLock<String>,
    role: Role,
    /// Back-reference to the joined VM. The VM's user list is the owner.
    vm: Mutex<Option<Weak<VmController>>>,
}

impl User {
    pub fn new(session: Arc<Session>, name: String, role: Role) -> Self {
        Self {
            address: session.remote().ip(),
            session,
            name: RwLock::new(name),
            role,
            vm: Mutex::new(None),
        }
    }

    /// Identity of the user, shared with its session.
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Replace the display name, returning the previous one.
    pub fn set_name(&self, name: String) -> String {
        std::mem::replace(&mut *self.name.write(), name)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn vm(&self) -> Option<Arc<VmController>> {
        self.vm.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_vm(&self, vm: Option<&Arc<VmController>>) {
        *self.vm.lock() = vm.map(Arc::downgrade);
    }

    pub fn send(&self, msg: &Message) -> bool {
        self.session.send_message(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_returns_previous() {
        let (s, _rx) = Session::test_pair("192.0.2.4:5000");
        let user = User::new(s, "guest00001".into(), Role::Guest);
        assert_eq!(user.address().to_string(), "192.0.2.4");
        assert_eq!(user.set_name("alice".into()), "guest00001");
        assert_eq!(user.name(), "alice");
        assert!(user.vm().is_none());
    }
}
