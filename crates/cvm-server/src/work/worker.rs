//! The worker thread: sole owner of the user map.

use crate::ip_data::IpRegistry;
use crate::session::{Session, User};
use crate::vm::VmRegistry;
use crate::work::{WorkItem, WorkQueue};
use cvm_core::messages::{
    JoinVmResultPayload, RenameResultPayload, RenameStatus, RenameUserPayload, VmListPayload,
};
use cvm_core::{cbor_decode, Message, Role};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

const NAME_MIN: usize = 3;
const NAME_MAX: usize = 20;

/// Usernames are 3-20 ASCII letters, digits, spaces, `_` or `-`.
pub fn valid_username(name: &str) -> bool {
    (NAME_MIN..=NAME_MAX).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        && name.trim() == name
}

pub struct Worker {
    registry: Arc<IpRegistry>,
    vms: Arc<VmRegistry>,
    users: HashMap<u64, Arc<User>>,
}

impl Worker {
    pub fn new(registry: Arc<IpRegistry>, vms: Arc<VmRegistry>) -> Self {
        Self {
            registry,
            vms,
            users: HashMap::new(),
        }
    }

    /// Drain `queue` on a dedicated thread until it is stopped.
    pub fn spawn(mut self, queue: Arc<WorkQueue>) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("cvm-worker".into())
            .spawn(move || {
                while let Some(item) = queue.pop() {
                    self.process(item);
                }
                info!(users = self.users.len(), "worker stopped");
            })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn process(&mut self, item: WorkItem) {
        match item {
            WorkItem::AddConnection(session) => self.add_connection(session),
            WorkItem::RemoveConnection(session) => self.remove_connection(&session),
            WorkItem::Message(session, payload) => self.handle_message(&session, &payload),
        }
    }

    fn add_connection(&mut self, session: Arc<Session>) {
        if self.users.contains_key(&session.id()) {
            return;
        }
        let address = session.remote().ip();
        if self.registry.find(address).is_none() {
            // Verification always creates the entry; keep the books balanced anyway.
            warn!(ip = %address, "no IP data for new connection");
            self.registry.acquire(address);
        }

        let name = self.generate_guest_name();
        let user = Arc::new(User::new(session, name.clone(), Role::Guest));
        self.users.insert(user.id(), user.clone());
        info!(ip = %address, user = %name, "User Connected");

        user.send(&Message::RenameResult(RenameResultPayload {
            status: RenameStatus::Ok,
            username: name,
        }));
    }

    fn remove_connection(&mut self, session: &Session) {
        let Some(user) = self.users.get(&session.id()).cloned() else {
            return;
        };
        self.registry.release(user.address());
        if let Some(vm) = user.vm() {
            vm.leave(&user);
        }
        self.users.remove(&session.id());
        info!(ip = %user.address(), user = %user.name(), "User Disconnected");
    }

    fn handle_message(&mut self, session: &Session, payload: &[u8]) {
        let Some(user) = self.users.get(&session.id()).cloned() else {
            debug!(session = session.id(), "message for unknown session dropped");
            return;
        };
        let msg: Message = match cbor_decode(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(user = %user.name(), error = %e, "dropping malformed message");
                return;
            }
        };
        self.dispatch(&user, msg);
    }

    fn dispatch(&mut self, user: &Arc<User>, msg: Message) {
        match msg {
            Message::ListVms => {
                user.send(&Message::VmList(VmListPayload {
                    vms: self.vms.list(),
                }));
            }
            Message::JoinVm(p) => {
                let Some(vm) = self.vms.get(&p.id).cloned() else {
                    user.send(&Message::JoinVmResult(JoinVmResultPayload {
                        id: p.id,
                        joined: false,
                    }));
                    return;
                };
                if let Some(current) = user.vm() {
                    if Arc::ptr_eq(&current, &vm) {
                        user.send(&Message::JoinVmResult(JoinVmResultPayload {
                            id: p.id,
                            joined: true,
                        }));
                        return;
                    }
                    current.leave(user);
                }
                user.send(&Message::JoinVmResult(JoinVmResultPayload {
                    id: p.id,
                    joined: true,
                }));
                vm.join(user);
            }
            Message::LeaveVm => {
                if let Some(vm) = user.vm() {
                    vm.leave(user);
                }
            }
            Message::Rename(p) => self.rename(user, p.username),
            Message::Key(p) => {
                if let Some(vm) = user.vm() {
                    vm.key(user, p.keysym, p.down);
                }
            }
            Message::Mouse(p) => {
                if let Some(vm) = user.vm() {
                    vm.mouse(user, p.x, p.y, p.buttons);
                }
            }
            other => {
                debug!(user = %user.name(), kind = other.kind(), "unexpected message from client");
            }
        }
    }

    fn rename(&mut self, user: &Arc<User>, requested: String) {
        let current = user.name();
        let status = if !valid_username(&requested) {
            RenameStatus::Invalid
        } else if self.name_taken(&requested, user.id()) {
            RenameStatus::Taken
        } else {
            RenameStatus::Ok
        };

        if status != RenameStatus::Ok || requested == current {
            user.send(&Message::RenameResult(RenameResultPayload {
                status,
                username: current,
            }));
            return;
        }

        let old = user.set_name(requested.clone());
        info!(old = %old, new = %requested, "user renamed");
        user.send(&Message::RenameResult(RenameResultPayload {
            status: RenameStatus::Ok,
            username: requested.clone(),
        }));
        if let Some(vm) = user.vm() {
            vm.broadcast(&Message::RenameUser(RenameUserPayload {
                old,
                new: requested,
            }));
        }
    }

    fn name_taken(&self, name: &str, except: u64) -> bool {
        self.users
            .values()
            .any(|u| u.id() != except && u.name().eq_ignore_ascii_case(name))
    }

    fn generate_guest_name(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let name = format!("guest{:05}", rng.gen_range(0..100_000));
            if !self.name_taken(&name, 0) {
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayConfig, VmConfig};
    use crate::vm::VmController;
    use cvm_core::messages::{JoinVmPayload, KeyPayload, RenamePayload};
    use cvm_core::{cbor_encode, RegionEncoding};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn setup() -> (Worker, Arc<IpRegistry>, Arc<VmRegistry>) {
        let registry = Arc::new(IpRegistry::new());
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let vm = VmController::new(
            &VmConfig {
                id: "vm1".into(),
                name: "VM One".into(),
                host: "127.0.0.1".into(),
                port,
                password: None,
                retry_count: 0,
                autostart: true,
            },
            &DisplayConfig {
                encoding: RegionEncoding::Png,
                jpeg_quality: 75,
            },
        );
        let vms = Arc::new(VmRegistry::from_controllers(vec![vm]));
        (Worker::new(registry.clone(), vms.clone()), registry, vms)
    }

    fn connect(
        worker: &mut Worker,
        registry: &IpRegistry,
        addr: &str,
    ) -> (Arc<Session>, mpsc::Receiver<Arc<[u8]>>) {
        let (s, rx) = Session::test_pair(addr);
        registry.acquire(s.remote().ip());
        worker.process(WorkItem::AddConnection(s.clone()));
        (s, rx)
    }

    fn frame(msg: &Message) -> Vec<u8> {
        cbor_encode(msg).unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<[u8]>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(cbor_decode(&f).unwrap());
        }
        out
    }

    fn greeted_name(msgs: &[Message]) -> String {
        match msgs.first() {
            Some(Message::RenameResult(p)) => p.username.clone(),
            other => panic!("expected rename_result, got {other:?}"),
        }
    }

    #[test]
    fn usernames() {
        assert!(valid_username("alice"));
        assert!(valid_username("a b_c-1"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("x".repeat(21).as_str()));
        assert!(!valid_username("bad!name"));
        assert!(!valid_username(" padded"));
    }

    #[test]
    fn connect_assigns_guest_name() {
        let (mut w, reg, _) = setup();
        let (_s, mut rx) = connect(&mut w, &reg, "10.0.0.1:1000");
        let name = greeted_name(&drain(&mut rx));
        assert!(name.starts_with("guest"));
        assert_eq!(name.len(), 10);
        assert!(name[5..].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(w.user_count(), 1);
    }

    #[test]
    fn remove_releases_ip_and_vm() {
        let (mut w, reg, vms) = setup();
        let (s, _rx) = connect(&mut w, &reg, "10.0.0.1:1000");
        w.process(WorkItem::Message(
            s.clone(),
            frame(&Message::JoinVm(JoinVmPayload { id: "vm1".into() })),
        ));
        let vm = vms.get("vm1").unwrap();
        assert_eq!(vm.users().len(), 1);

        w.process(WorkItem::RemoveConnection(s.clone()));
        assert_eq!(w.user_count(), 0);
        assert!(vm.users().is_empty());
        assert_eq!(reg.find(s.remote().ip()).unwrap().connection_count, 0);

        // A second removal is a no-op.
        w.process(WorkItem::RemoveConnection(s.clone()));
        assert_eq!(reg.find(s.remote().ip()).unwrap().connection_count, 0);
    }

    #[test]
    fn malformed_message_is_dropped() {
        let (mut w, reg, _) = setup();
        let (s, mut rx) = connect(&mut w, &reg, "10.0.0.1:1000");
        drain(&mut rx);
        w.process(WorkItem::Message(s.clone(), vec![0xff, 0x00, 0x13]));
        assert!(drain(&mut rx).is_empty());

        w.process(WorkItem::Message(s, frame(&Message::ListVms)));
        match drain(&mut rx).as_slice() {
            [Message::VmList(list)] => {
                assert_eq!(list.vms.len(), 1);
                assert_eq!(list.vms[0].id, "vm1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_unknown_vm_fails() {
        let (mut w, reg, _) = setup();
        let (s, mut rx) = connect(&mut w, &reg, "10.0.0.1:1000");
        drain(&mut rx);
        w.process(WorkItem::Message(
            s,
            frame(&Message::JoinVm(JoinVmPayload { id: "nope".into() })),
        ));
        match drain(&mut rx).as_slice() {
            [Message::JoinVmResult(r)] => assert!(!r.joined),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rename_rules() {
        let (mut w, reg, _) = setup();
        let (a, mut ra) = connect(&mut w, &reg, "10.0.0.1:1000");
        let (b, mut rb) = connect(&mut w, &reg, "10.0.0.2:1000");
        drain(&mut ra);
        drain(&mut rb);

        let rename = |name: &str| {
            frame(&Message::Rename(RenamePayload {
                username: name.into(),
            }))
        };

        w.process(WorkItem::Message(a.clone(), rename("alice")));
        w.process(WorkItem::Message(b.clone(), rename("ALICE")));
        w.process(WorkItem::Message(b.clone(), rename("!")));

        match drain(&mut ra).as_slice() {
            [Message::RenameResult(r)] => {
                assert_eq!(r.status, RenameStatus::Ok);
                assert_eq!(r.username, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
        let statuses: Vec<RenameStatus> = drain(&mut rb)
            .into_iter()
            .filter_map(|m| match m {
                Message::RenameResult(r) => Some(r.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![RenameStatus::Taken, RenameStatus::Invalid]);
    }

    #[test]
    fn rename_is_broadcast_to_vm() {
        let (mut w, reg, _) = setup();
        let (a, mut ra) = connect(&mut w, &reg, "10.0.0.1:1000");
        let (b, mut rb) = connect(&mut w, &reg, "10.0.0.2:1000");
        let join = frame(&Message::JoinVm(JoinVmPayload { id: "vm1".into() }));
        w.process(WorkItem::Message(a.clone(), join.clone()));
        w.process(WorkItem::Message(b.clone(), join));
        let old = greeted_name(&drain(&mut ra));
        drain(&mut rb);

        w.process(WorkItem::Message(
            a,
            frame(&Message::Rename(RenamePayload {
                username: "alice".into(),
            })),
        ));
        let seen = drain(&mut rb);
        assert!(seen.iter().any(|m| matches!(
            m,
            Message::RenameUser(p) if p.old == old && p.new == "alice"
        )));
    }

    #[test]
    fn input_without_vm_is_ignored() {
        let (mut w, reg, _) = setup();
        let (s, mut rx) = connect(&mut w, &reg, "10.0.0.1:1000");
        drain(&mut rx);
        w.process(WorkItem::Message(
            s,
            frame(&Message::Key(KeyPayload {
                keysym: 0x61,
                down: true,
            })),
        ));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn queue_items_apply_in_order() {
        let (w, reg, vms) = setup();
        let queue = Arc::new(WorkQueue::new());
        let handle = w.spawn(queue.clone()).unwrap();

        let (s, mut rx) = Session::test_pair("10.0.0.9:1000");
        reg.acquire(s.remote().ip());
        queue.push(WorkItem::AddConnection(s.clone()));
        queue.push(WorkItem::Message(s.clone(), frame(&Message::ListVms)));
        queue.push(WorkItem::Message(
            s.clone(),
            frame(&Message::JoinVm(JoinVmPayload { id: "vm1".into() })),
        ));
        queue.push(WorkItem::RemoveConnection(s.clone()));
        // Arrives after removal: must be dropped.
        queue.push(WorkItem::Message(s.clone(), frame(&Message::ListVms)));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !queue.is_empty() || reg.find(s.remote().ip()).unwrap().connection_count != 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(20));
        queue.stop();
        handle.join().unwrap();

        let kinds: Vec<&'static str> = drain(&mut rx).iter().map(Message::kind).collect();
        assert_eq!(kinds, vec!["rename_result", "vm_list", "join_vm_result", "add_user"]);
        assert!(vms.get("vm1").unwrap().users().is_empty());
    }
}
