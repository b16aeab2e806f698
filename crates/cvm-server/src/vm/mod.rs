//! Virtual machine controllers.
//!
//! Each controller owns one upstream [`VncClient`] and the list of users
//! watching it. Region and cursor updates arrive on the client thread and are
//! encoded once, then queued to every member's session before the client
//! reads the next upstream message.

pub mod region;
pub mod rfb;
pub mod surface;
pub mod vnc;

use crate::config::{DisplayConfig, VmConfig};
use crate::session::{User, UserList};
use cvm_core::messages::{AddUserPayload, RemoveUserPayload, ScreenSizePayload, VmInfo};
use cvm_core::{cbor_encode, ControllerStatus, CvmError, Message};
use parking_lot::Mutex;
use region::{CursorImage, Region};
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use vnc::{UpstreamEvents, VncClient, VncClientOptions};

/// Pause between reconnection attempts after an upstream failure.
const RETRY_DELAY: Duration = Duration::from_secs(2);

struct Lifecycle {
    status: ControllerStatus,
    retries_left: u32,
}

pub struct VmController {
    id: String,
    name: String,
    autostart: bool,
    retry_count: u32,
    retry_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    cursor: Mutex<Option<CursorImage>>,
    /// Last desktop size reported upstream, cleared on disconnect.
    screen: Mutex<Option<(u16, u16)>>,
    users: UserList,
    client: VncClient,
    weak_self: Weak<VmController>,
}

impl VmController {
    pub fn new(config: &VmConfig, display: &DisplayConfig) -> Arc<Self> {
        Self::with_retry_delay(config, display, RETRY_DELAY)
    }

    pub(crate) fn with_retry_delay(
        config: &VmConfig,
        display: &DisplayConfig,
        retry_delay: Duration,
    ) -> Arc<Self> {
        let options = VncClientOptions {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            encoding: display.encoding,
            jpeg_quality: display.jpeg_quality,
        };
        Arc::new_cyclic(|weak: &Weak<VmController>| {
            let events: Weak<dyn UpstreamEvents> = weak.clone();
            Self {
                id: config.id.clone(),
                name: config.name.clone(),
                autostart: config.autostart,
                retry_count: config.retry_count,
                retry_delay,
                lifecycle: Mutex::new(Lifecycle {
                    status: ControllerStatus::Stopped,
                    retries_left: config.retry_count,
                }),
                cursor: Mutex::new(None),
                screen: Mutex::new(None),
                users: UserList::new(),
                client: VncClient::new(options, events),
                weak_self: weak.clone(),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn autostart(&self) -> bool {
        self.autostart
    }

    pub fn status(&self) -> ControllerStatus {
        self.lifecycle.lock().status
    }

    pub fn users(&self) -> &UserList {
        &self.users
    }

    pub fn info(&self) -> VmInfo {
        VmInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status(),
        }
    }

    fn transition(&self, lc: &mut Lifecycle, status: ControllerStatus) {
        if lc.status != status {
            info!(vm = %self.id, from = ?lc.status, to = ?status, "VM status changed");
            lc.status = status;
        }
    }

    /// Begin connecting to the upstream server. No-op unless stopped.
    pub fn start(&self) {
        {
            let mut lc = self.lifecycle.lock();
            if lc.status != ControllerStatus::Stopped {
                return;
            }
            lc.retries_left = self.retry_count;
            self.transition(&mut lc, ControllerStatus::Starting);
        }
        self.connect_client();
    }

    fn connect_client(&self) {
        if let Err(e) = self.client.connect() {
            warn!(vm = %self.id, error = %e, "cannot start upstream client");
            let mut lc = self.lifecycle.lock();
            self.transition(&mut lc, ControllerStatus::Stopped);
            return;
        }
        // A stop that landed between the caller's status check and the
        // spawn found no thread to join; reap the new one here.
        if self.status() == ControllerStatus::Stopped {
            debug!(vm = %self.id, "stopped while connecting, dropping upstream");
            self.client.disconnect();
        }
    }

    /// Disconnect upstream and stay stopped.
    pub fn stop(&self) {
        {
            let mut lc = self.lifecycle.lock();
            self.transition(&mut lc, ControllerStatus::Stopped);
        }
        self.client.disconnect();
    }

    /// Drop the upstream connection and reconnect.
    pub fn reset(&self) {
        {
            let mut lc = self.lifecycle.lock();
            self.transition(&mut lc, ControllerStatus::Resetting);
        }
        self.client.disconnect();
        {
            let mut lc = self.lifecycle.lock();
            if lc.status != ControllerStatus::Resetting {
                return;
            }
            lc.retries_left = self.retry_count;
            self.transition(&mut lc, ControllerStatus::Starting);
        }
        self.connect_client();
    }

    fn schedule_retry(&self) {
        let weak = self.weak_self.clone();
        let delay = self.retry_delay;
        let spawned = std::thread::Builder::new()
            .name(format!("vm-retry-{}", self.id))
            .spawn(move || {
                std::thread::sleep(delay);
                if let Some(vm) = weak.upgrade() {
                    if vm.status() == ControllerStatus::Starting {
                        debug!(vm = %vm.id, "retrying upstream connection");
                        vm.connect_client();
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(vm = %self.id, error = %e, "cannot schedule retry");
            let mut lc = self.lifecycle.lock();
            self.transition(&mut lc, ControllerStatus::Stopped);
        }
    }

    /// Add `user` as a viewer. Returns false if it was already a member.
    pub fn join(self: &Arc<Self>, user: &Arc<User>) -> bool {
        if self.users.contains(user) {
            return false;
        }
        // The size goes out before membership so no broadcast rect can
        // precede it.
        let screen = *self.screen.lock();
        if let Some((width, height)) = screen {
            user.send(&Message::ScreenSize(ScreenSizePayload { width, height }));
        }
        if !self.users.add(user) {
            return false;
        }
        user.set_vm(Some(self));
        info!(vm = %self.id, user = %user.name(), "user joined VM");

        self.users.for_each(|member| {
            user.send(&Message::AddUser(AddUserPayload {
                username: member.name(),
                role: member.role(),
            }));
            ControlFlow::Continue(())
        });
        self.broadcast_except(
            user.id(),
            &Message::AddUser(AddUserPayload {
                username: user.name(),
                role: user.role(),
            }),
        );

        if !self.autostart && self.status() == ControllerStatus::Stopped {
            self.start();
        }
        self.send_snapshot(user);
        true
    }

    /// Send the current desktop to one user. The frame is encoded on the
    /// client thread so it is ordered with the updates around it.
    fn send_snapshot(&self, user: &Arc<User>) {
        if let Some(cursor) = self.cursor.lock().as_ref() {
            user.send(&cursor.to_message());
        }
        let target = Arc::downgrade(user);
        let options = self.client.options();
        let (encoding, quality) = (options.encoding, options.jpeg_quality);
        let vm = self.id.clone();
        self.client.inspect(move |surface| {
            let Some(user) = target.upgrade() else {
                return;
            };
            let (w, h) = (surface.width(), surface.height());
            user.send(&Message::ScreenSize(ScreenSizePayload {
                width: w,
                height: h,
            }));
            if w == 0 || h == 0 {
                return;
            }
            match Region::encode(surface, 0, 0, w, h, encoding, quality) {
                Ok(region) => {
                    user.send(&region.into_message());
                }
                Err(e) => debug!(vm = %vm, error = %e, "snapshot encode failed"),
            }
        });
    }

    /// Remove `user` from the viewers. Returns false if it was not a member.
    pub fn leave(&self, user: &User) -> bool {
        if !self.users.remove(user) {
            return false;
        }
        user.set_vm(None);
        info!(vm = %self.id, user = %user.name(), "user left VM");
        self.broadcast(&Message::RemoveUser(RemoveUserPayload {
            username: user.name(),
        }));
        true
    }

    pub fn key(&self, user: &User, keysym: u32, down: bool) {
        if self.users.contains(user) {
            self.client.send_key(keysym, down);
        }
    }

    pub fn mouse(&self, user: &User, x: u16, y: u16, buttons: u8) {
        if self.users.contains(user) {
            self.client.send_pointer(x, y, buttons);
        }
    }

    /// Encode `msg` once and queue it to every member.
    pub fn broadcast(&self, msg: &Message) {
        self.broadcast_filtered(msg, |_| true);
    }

    fn broadcast_except(&self, skip: u64, msg: &Message) {
        self.broadcast_filtered(msg, |u| u.id() != skip);
    }

    fn broadcast_filtered(&self, msg: &Message, include: impl Fn(&User) -> bool) {
        let payload: Arc<[u8]> = match cbor_encode(msg) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                warn!(vm = %self.id, kind = msg.kind(), error = %e, "broadcast encode failed");
                return;
            }
        };
        self.users.for_each_locked(|user| {
            if include(user) {
                user.session().send(payload.clone());
            }
            ControlFlow::Continue(())
        });
    }
}

impl UpstreamEvents for VmController {
    fn on_connect(&self, width: u16, height: u16) {
        {
            let mut lc = self.lifecycle.lock();
            if lc.status == ControllerStatus::Stopped {
                debug!(vm = %self.id, "upstream connected after stop, closing");
                self.client.request_stop();
                return;
            }
            lc.retries_left = self.retry_count;
            self.transition(&mut lc, ControllerStatus::Started);
        }
        *self.screen.lock() = Some((width, height));
        self.broadcast(&Message::ScreenSize(ScreenSizePayload { width, height }));
    }

    fn on_disconnect(&self, error: Option<CvmError>) {
        *self.screen.lock() = None;
        let retry = {
            let mut lc = self.lifecycle.lock();
            match lc.status {
                ControllerStatus::Stopped | ControllerStatus::Resetting => false,
                ControllerStatus::Starting | ControllerStatus::Started => match error {
                    None => {
                        self.transition(&mut lc, ControllerStatus::Stopped);
                        false
                    }
                    Some(_) if lc.retries_left > 0 => {
                        lc.retries_left -= 1;
                        self.transition(&mut lc, ControllerStatus::Starting);
                        true
                    }
                    Some(e) => {
                        warn!(vm = %self.id, error = %e, "upstream retries exhausted");
                        self.transition(&mut lc, ControllerStatus::Stopped);
                        false
                    }
                },
            }
        };
        if retry {
            self.schedule_retry();
        }
    }

    fn on_resize(&self, width: u16, height: u16) {
        *self.screen.lock() = Some((width, height));
        self.broadcast(&Message::ScreenSize(ScreenSizePayload { width, height }));
    }

    fn on_region(&self, region: Region) {
        self.broadcast(&region.into_message());
    }

    fn on_cursor(&self, cursor: CursorImage) {
        let msg = cursor.to_message();
        *self.cursor.lock() = Some(cursor);
        self.broadcast(&msg);
    }
}

/// All configured VMs, in configuration order.
pub struct VmRegistry {
    vms: Vec<Arc<VmController>>,
}

impl VmRegistry {
    pub fn new(configs: &[VmConfig], display: &DisplayConfig) -> Self {
        Self {
            vms: configs
                .iter()
                .map(|c| VmController::new(c, display))
                .collect(),
        }
    }

    pub fn from_controllers(vms: Vec<Arc<VmController>>) -> Self {
        Self { vms }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<VmController>> {
        self.vms.iter().find(|vm| vm.id() == id)
    }

    pub fn list(&self) -> Vec<VmInfo> {
        self.vms.iter().map(|vm| vm.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn start_autostart(&self) {
        for vm in self.vms.iter().filter(|vm| vm.autostart()) {
            vm.start();
        }
    }

    pub fn stop_all(&self) {
        for vm in &self.vms {
            vm.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use cvm_core::{cbor_decode, RegionEncoding, Role};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc;
    use vnc::VncState;

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// RFB 3.8 server that completes the handshake and then idles until the
    /// client hangs up. With `drop_first` the first connection is closed
    /// before the version banner.
    fn idle_server(drop_first: bool) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = accepted.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut s) = stream else { break };
                if count.fetch_add(1, Ordering::SeqCst) == 0 && drop_first {
                    continue;
                }
                std::thread::spawn(move || {
                    let _ = serve_idle(&mut s);
                });
            }
        });
        (port, accepted)
    }

    fn serve_idle(s: &mut TcpStream) -> std::io::Result<()> {
        s.write_all(b"RFB 003.008\n")?;
        let mut version = [0u8; 12];
        s.read_exact(&mut version)?;
        s.write_all(&[1, rfb::SECURITY_NONE])?;
        let mut one = [0u8; 1];
        s.read_exact(&mut one)?;
        s.write_all(&0u32.to_be_bytes())?;
        s.read_exact(&mut one)?;

        let mut init = Vec::new();
        init.extend_from_slice(&4u16.to_be_bytes());
        init.extend_from_slice(&2u16.to_be_bytes());
        init.extend_from_slice(&rfb::RfbPixelFormat::preferred().to_bytes());
        init.extend_from_slice(&4u32.to_be_bytes());
        init.extend_from_slice(b"idle");
        s.write_all(&init)?;

        let mut buf = [0u8; 256];
        while s.read(&mut buf)? > 0 {}
        Ok(())
    }

    fn vm_config(autostart: bool, retry_count: u32) -> VmConfig {
        VmConfig {
            id: "vm1".into(),
            name: "Test VM".into(),
            host: "127.0.0.1".into(),
            port: closed_port(),
            password: None,
            retry_count,
            autostart,
        }
    }

    fn display() -> DisplayConfig {
        DisplayConfig {
            encoding: RegionEncoding::Png,
            jpeg_quality: 75,
        }
    }

    fn user(name: &str) -> (Arc<User>, mpsc::Receiver<Arc<[u8]>>) {
        let (s, rx) = Session::test_pair("127.0.0.1:4000");
        (Arc::new(User::new(s, name.into(), Role::Guest)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<[u8]>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(cbor_decode(&frame).unwrap());
        }
        out
    }

    fn added(msgs: &[Message]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match m {
                Message::AddUser(p) => Some(p.username.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn members_receive_identical_region() {
        let vm = VmController::new(&vm_config(true, 0), &display());
        let (a, mut ra) = user("alice");
        let (b, mut rb) = user("bob");
        assert!(vm.join(&a));
        assert!(vm.join(&b));
        drain(&mut ra);
        drain(&mut rb);

        vm.on_region(Region {
            x: 1,
            y: 2,
            width: 3,
            height: 4,
            encoding: RegionEncoding::Png,
            data: vec![9, 8, 7],
        });

        let fa = ra.try_recv().unwrap();
        let fb = rb.try_recv().unwrap();
        assert_eq!(fa, fb);
        match cbor_decode::<Message>(&fa).unwrap() {
            Message::Rect(r) => assert_eq!((r.x, r.y, r.data), (1, 2, vec![9, 8, 7])),
            other => panic!("unexpected {}", other.kind()),
        }
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn join_and_leave_announce_membership() {
        let vm = VmController::new(&vm_config(true, 0), &display());
        let (a, mut ra) = user("alice");
        let (b, mut rb) = user("bob");

        assert!(vm.join(&a));
        assert_eq!(added(&drain(&mut ra)), vec!["alice"]);
        assert!(Arc::ptr_eq(&a.vm().unwrap(), &vm));

        assert!(vm.join(&b));
        assert_eq!(added(&drain(&mut rb)), vec!["alice", "bob"]);
        assert_eq!(added(&drain(&mut ra)), vec!["bob"]);
        assert!(!vm.join(&b));
        assert_eq!(vm.users().len(), 2);

        assert!(vm.leave(&b));
        assert!(b.vm().is_none());
        assert!(!vm.leave(&b));
        match drain(&mut ra).as_slice() {
            [Message::RemoveUser(p)] => assert_eq!(p.username, "bob"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn screen_size_reaches_members_on_connect() {
        let vm = VmController::new(&vm_config(true, 0), &display());
        let (a, mut ra) = user("alice");
        vm.join(&a);
        drain(&mut ra);
        vm.lifecycle.lock().status = ControllerStatus::Starting;

        vm.on_connect(640, 480);
        assert_eq!(vm.status(), ControllerStatus::Started);
        match drain(&mut ra).as_slice() {
            [Message::ScreenSize(p)] => assert_eq!((p.width, p.height), (640, 480)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn joiner_sees_screen_size_first() {
        let vm = VmController::new(&vm_config(true, 0), &display());
        vm.lifecycle.lock().status = ControllerStatus::Starting;
        vm.on_connect(640, 480);

        let (a, mut ra) = user("alice");
        assert!(vm.join(&a));
        let msgs = drain(&mut ra);
        assert!(
            matches!(msgs.first(), Some(Message::ScreenSize(p)) if (p.width, p.height) == (640, 480)),
            "got {msgs:?}"
        );
        assert_eq!(added(&msgs), vec!["alice"]);
    }

    #[test]
    fn stop_cancels_pending_retry() {
        let (port, accepted) = idle_server(true);
        let mut config = vm_config(true, 3);
        config.port = port;
        let vm = VmController::with_retry_delay(&config, &display(), Duration::from_millis(300));

        vm.start();
        wait_until("first attempt to fail", || {
            accepted.load(Ordering::SeqCst) == 1
                && vm.client.state() == VncState::Disconnected
                && vm.lifecycle.lock().retries_left == 2
        });
        vm.stop();

        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(vm.status(), ControllerStatus::Stopped);
        assert_eq!(vm.client.state(), VncState::Disconnected);
    }

    #[test]
    fn connect_racing_stop_leaves_no_upstream() {
        let (port, _accepted) = idle_server(false);
        let mut config = vm_config(true, 3);
        config.port = port;
        let vm = VmController::new(&config, &display());
        assert_eq!(vm.status(), ControllerStatus::Stopped);

        // A retry that passed its status check just before stop() ran.
        vm.connect_client();
        assert_eq!(vm.client.state(), VncState::Disconnected);
        assert_eq!(vm.status(), ControllerStatus::Stopped);
    }

    #[test]
    fn late_connect_after_stop_closes_upstream() {
        let (port, _accepted) = idle_server(false);
        let mut config = vm_config(true, 0);
        config.port = port;
        let vm = VmController::new(&config, &display());
        vm.start();
        wait_until("upstream connected", || vm.status() == ControllerStatus::Started);

        vm.lifecycle.lock().status = ControllerStatus::Stopped;
        vm.on_connect(4, 2);
        wait_until("upstream to close", || vm.client.state() == VncState::Disconnected);
        assert_eq!(vm.status(), ControllerStatus::Stopped);
    }

    #[test]
    fn retries_then_stops() {
        let vm = VmController::with_retry_delay(
            &vm_config(true, 2),
            &display(),
            Duration::from_millis(10),
        );
        vm.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while vm.status() != ControllerStatus::Stopped {
            assert!(std::time::Instant::now() < deadline, "VM never gave up");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(vm.lifecycle.lock().retries_left, 0);
    }

    #[test]
    fn reset_restarts_with_fresh_retries() {
        let vm = VmController::with_retry_delay(
            &vm_config(true, 1),
            &display(),
            Duration::from_millis(10),
        );
        vm.reset();
        assert_ne!(vm.status(), ControllerStatus::Resetting);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while vm.status() != ControllerStatus::Stopped {
            assert!(std::time::Instant::now() < deadline, "VM never gave up");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(vm.lifecycle.lock().retries_left, 0);
    }

    #[test]
    fn stop_is_terminal() {
        let vm = VmController::new(&vm_config(true, 5), &display());
        vm.start();
        vm.stop();
        assert_eq!(vm.status(), ControllerStatus::Stopped);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(vm.status(), ControllerStatus::Stopped);
    }

    #[test]
    fn registry_lists_in_order() {
        let mut second = vm_config(false, 0);
        second.id = "vm2".into();
        let reg = VmRegistry::new(&[vm_config(true, 0), second], &display());
        let ids: Vec<String> = reg.list().into_iter().map(|v| v.id).collect();
        assert_eq!(ids, vec!["vm1", "vm2"]);
        assert!(reg.get("vm2").is_some());
        assert!(reg.get("nope").is_none());
    }
}
