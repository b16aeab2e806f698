//! Upstream VNC client.
//!
//! One client per virtual machine. `connect` spawns a dedicated thread that
//! performs the RFB handshake and then blocks on the server's message stream,
//! decoding framebuffer updates into the desktop [`Surface`] and reporting
//! regions, resizes and cursor changes through [`UpstreamEvents`].
//!
//! The desktop surface is only ever touched by that thread. Other threads
//! that need to read it queue a closure with [`VncClient::inspect`].

use crate::vm::region::{CursorImage, Region};
use crate::vm::rfb::{self, RfbPixelFormat};
use crate::vm::surface::{PixelFormat, Surface};
use cvm_core::{CvmError, CvmResult, RegionEncoding};
use parking_lot::Mutex;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wait for the next server message type byte before re-checking the stop flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeout for the remainder of a message once it has started, and for writes.
const IO_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Encodings requested from the server, in preference order.
const ENCODINGS: [i32; 4] = [
    rfb::ENCODING_COPY_RECT,
    rfb::ENCODING_RAW,
    rfb::ENCODING_DESKTOP_SIZE,
    rfb::ENCODING_CURSOR,
];

/// Connection parameters for one upstream server.
#[derive(Debug, Clone)]
pub struct VncClientOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Encoding applied to outgoing regions.
    pub encoding: RegionEncoding,
    /// JPEG quality (0-100), ignored for PNG.
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VncState {
    Disconnected,
    ConnectingToServer,
    Connected,
}

/// Callbacks invoked on the client thread.
pub trait UpstreamEvents: Send + Sync {
    /// Handshake finished; the desktop is `width` x `height`.
    fn on_connect(&self, width: u16, height: u16);
    /// The client thread is exiting. `error` is `None` when the disconnect was requested.
    fn on_disconnect(&self, error: Option<CvmError>);
    fn on_resize(&self, width: u16, height: u16);
    fn on_region(&self, region: Region);
    fn on_cursor(&self, cursor: CursorImage);
}

type Inspection = Box<dyn FnOnce(&Surface) + Send>;

struct Shared {
    state: Mutex<VncState>,
    stop: AtomicBool,
    /// Write half used for input events from other threads.
    writer: Mutex<Option<TcpStream>>,
    inspections: Mutex<Vec<Inspection>>,
}

pub struct VncClient {
    options: VncClientOptions,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    events: Weak<dyn UpstreamEvents>,
}

impl VncClient {
    pub fn new(options: VncClientOptions, events: Weak<dyn UpstreamEvents>) -> Self {
        Self {
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(VncState::Disconnected),
                stop: AtomicBool::new(false),
                writer: Mutex::new(None),
                inspections: Mutex::new(Vec::new()),
            }),
            thread: Mutex::new(None),
            events,
        }
    }

    pub fn state(&self) -> VncState {
        *self.shared.state.lock()
    }

    pub fn options(&self) -> &VncClientOptions {
        &self.options
    }

    /// Start connecting on a new thread. No-op unless disconnected.
    pub fn connect(&self) -> CvmResult<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != VncState::Disconnected {
                return Ok(());
            }
            *state = VncState::ConnectingToServer;
        }
        self.reap_thread();
        self.shared.stop.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let options = self.options.clone();
        let events = self.events.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("vnc-{}:{}", self.options.host, self.options.port))
            .spawn(move || run(shared, options, events));
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.shared.state.lock() = VncState::Disconnected;
                Err(CvmError::Io(e))
            }
        }
    }

    /// Stop the client thread and wait for it, unless called from that thread.
    pub fn disconnect(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(stream) = self.shared.writer.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.reap_thread();
    }

    /// Ask the client thread to exit at its next poll without waiting for it.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    fn reap_thread(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Run `f` against the desktop surface on the client thread.
    /// Returns false if the client is not connected.
    pub fn inspect(&self, f: impl FnOnce(&Surface) + Send + 'static) -> bool {
        if self.state() != VncState::Connected {
            return false;
        }
        self.shared.inspections.lock().push(Box::new(f));
        true
    }

    pub fn send_key(&self, keysym: u32, down: bool) {
        self.send_input(&rfb::build_key_event(down, keysym));
    }

    pub fn send_pointer(&self, x: u16, y: u16, buttons: u8) {
        self.send_input(&rfb::build_pointer_event(buttons, x, y));
    }

    fn send_input(&self, msg: &[u8]) {
        if self.state() != VncState::Connected {
            return;
        }
        send(&self.shared, msg);
    }
}

impl Drop for VncClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn send(shared: &Shared, msg: &[u8]) {
    let mut writer = shared.writer.lock();
    if let Some(stream) = writer.as_mut() {
        if let Err(e) = stream.write_all(msg) {
            debug!(error = %e, "upstream write failed");
        }
    }
}

fn run(shared: Arc<Shared>, options: VncClientOptions, events: Weak<dyn UpstreamEvents>) {
    let result = session(&shared, &options, &events);

    if let Some(stream) = shared.writer.lock().take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
    shared.inspections.lock().clear();
    *shared.state.lock() = VncState::Disconnected;

    let error = match result {
        _ if shared.stop.load(Ordering::SeqCst) => None,
        Ok(()) => None,
        Err(e) => {
            warn!(host = %options.host, port = options.port, error = %e, "upstream connection lost");
            Some(e)
        }
    };
    if let Some(events) = events.upgrade() {
        events.on_disconnect(error);
    }
}

fn open(options: &VncClientOptions) -> CvmResult<TcpStream> {
    let mut last_err = None;
    for addr in (options.host.as_str(), options.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => CvmError::Io(e),
        None => CvmError::Transport(format!("{} did not resolve", options.host)),
    })
}

fn session(
    shared: &Shared,
    options: &VncClientOptions,
    events: &Weak<dyn UpstreamEvents>,
) -> CvmResult<()> {
    let mut stream = open(options)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    *shared.writer.lock() = Some(stream.try_clone()?);
    if shared.stop.load(Ordering::SeqCst) {
        return Ok(());
    }

    let init = rfb::handshake(&mut stream, options.password.as_deref())?;
    info!(
        host = %options.host,
        port = options.port,
        name = %init.name,
        width = init.width,
        height = init.height,
        server_bpp = init.pixel_format.bits_per_pixel,
        "connected to upstream"
    );

    let mut desktop = Surface::new(init.width, init.height, PixelFormat::Bpp32)?;
    send(shared, &rfb::build_set_pixel_format(&RfbPixelFormat::preferred()));
    send(shared, &rfb::build_set_encodings(&ENCODINGS));
    send(shared, &rfb::build_update_request(false, 0, 0, init.width, init.height));

    *shared.state.lock() = VncState::Connected;
    if let Some(ev) = events.upgrade() {
        ev.on_connect(init.width, init.height);
    }

    let mut reader = BufReader::new(stream.try_clone()?);
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pending = std::mem::take(&mut *shared.inspections.lock());
        for inspect in pending {
            inspect(&desktop);
        }

        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        let msg_type = match rfb::read_u8(&mut reader) {
            Ok(t) => t,
            Err(CvmError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => return Err(e),
        };
        stream.set_read_timeout(Some(IO_TIMEOUT))?;

        match msg_type {
            rfb::MSG_FRAMEBUFFER_UPDATE => {
                read_update(&mut reader, &mut desktop, options, events)?;
                send(
                    shared,
                    &rfb::build_update_request(true, 0, 0, desktop.width(), desktop.height()),
                );
            }
            rfb::MSG_SET_COLOUR_MAP => {
                rfb::skip(&mut reader, 3)?;
                let count = rfb::read_u16(&mut reader)?;
                rfb::skip(&mut reader, count as u64 * 6)?;
            }
            rfb::MSG_BELL => {}
            rfb::MSG_SERVER_CUT_TEXT => {
                rfb::skip(&mut reader, 3)?;
                let len = rfb::read_u32(&mut reader)?;
                rfb::skip(&mut reader, len as u64)?;
            }
            other => {
                return Err(CvmError::Protocol(format!("unknown server message {other}")));
            }
        }
    }
}

fn read_update(
    reader: &mut BufReader<TcpStream>,
    desktop: &mut Surface,
    options: &VncClientOptions,
    events: &Weak<dyn UpstreamEvents>,
) -> CvmResult<()> {
    rfb::skip(reader, 1)?;
    let rects = rfb::read_u16(reader)?;
    for _ in 0..rects {
        let x = rfb::read_u16(reader)?;
        let y = rfb::read_u16(reader)?;
        let w = rfb::read_u16(reader)?;
        let h = rfb::read_u16(reader)?;
        let encoding = rfb::read_i32(reader)?;
        let bpp = desktop.format().bytes_per_pixel();

        match encoding {
            rfb::ENCODING_RAW => {
                check_bounds(desktop, x, y, w, h)?;
                let data = rfb::read_bytes(reader, w as usize * h as usize * bpp)?;
                desktop.write_pixels(x, y, w, h, &data)?;
                emit_region(desktop, x, y, w, h, options, events);
            }
            rfb::ENCODING_COPY_RECT => {
                let src_x = rfb::read_u16(reader)?;
                let src_y = rfb::read_u16(reader)?;
                check_bounds(desktop, x, y, w, h)?;
                desktop
                    .copy_rect(src_x, src_y, x, y, w, h)
                    .map_err(|e| CvmError::Protocol(e.to_string()))?;
                emit_region(desktop, x, y, w, h, options, events);
            }
            rfb::ENCODING_DESKTOP_SIZE => match Surface::new(w, h, desktop.format()) {
                Ok(resized) => {
                    *desktop = resized;
                    debug!(width = w, height = h, "upstream desktop resized");
                    if let Some(ev) = events.upgrade() {
                        ev.on_resize(w, h);
                    }
                }
                Err(e) => warn!(error = %e, "keeping previous desktop surface"),
            },
            rfb::ENCODING_CURSOR => {
                let pixels = rfb::read_bytes(reader, w as usize * h as usize * bpp)?;
                let mask = rfb::read_bytes(reader, (w as usize).div_ceil(8) * h as usize)?;
                if w == 0 || h == 0 {
                    continue;
                }
                let mut shape = Surface::new(w, h, desktop.format())?;
                shape.write_pixels(0, 0, w, h, &pixels)?;
                let cursor = CursorImage::from_rfb(&shape, &mask, x, y);
                if let Some(ev) = events.upgrade() {
                    ev.on_cursor(cursor);
                }
            }
            other => {
                return Err(CvmError::Protocol(format!("unsupported encoding {other}")));
            }
        }
    }
    Ok(())
}

fn check_bounds(desktop: &Surface, x: u16, y: u16, w: u16, h: u16) -> CvmResult<()> {
    if x as u32 + w as u32 > desktop.width() as u32 || y as u32 + h as u32 > desktop.height() as u32
    {
        return Err(CvmError::Protocol(format!(
            "rect {w}x{h}+{x}+{y} outside {}x{} desktop",
            desktop.width(),
            desktop.height()
        )));
    }
    Ok(())
}

fn emit_region(
    desktop: &Surface,
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    options: &VncClientOptions,
    events: &Weak<dyn UpstreamEvents>,
) {
    if w == 0 || h == 0 {
        return;
    }
    let Some(ev) = events.upgrade() else {
        return;
    };
    match Region::encode(desktop, x, y, w, h, options.encoding, options.jpeg_quality) {
        Ok(region) => ev.on_region(region),
        Err(e) => warn!(error = %e, "dropping region update"),
    }
}
