//! The tap instance: public surface and the reactor thread.
//!
//! One `Tap` bridges one overlay network to the userspace TCP stack. The
//! thread that creates it may add and remove addresses and inject inbound
//! frames; everything else — RPC handling, data pumping, timers, registry
//! mutation — happens on the dedicated reactor thread, under the core lock.

use crate::conn::Client;
use crate::core::{Core, FrameHandler, Waker};
use crate::error::TapError;
use crate::eth::{self, Mac};
use crate::slots::SlotId;
use crate::stack::lwip::{LwipStack, STACK_LIB_RELPATH};
use crate::stack::{NetifConfig, Stack, ARP_TIMER_INTERVAL, TCP_TIMER_INTERVAL};
use netcon_proto as proto;
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

/// Gateway address the tap interface is installed with.
const DEFAULT_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);

/// Service side of the socket intercept for one overlay network.
pub struct Tap {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

struct Shared {
    nwid: u64,
    mac: Mac,
    mtu: u16,
    dev: PathBuf,
    ips: Mutex<Vec<Ipv4Addr>>,
    core: Mutex<Core>,
    running: AtomicBool,
    enabled: AtomicBool,
    waker: Waker,
}

impl Tap {
    /// Start a tap for network `nwid`, loading the stack library from the
    /// service home directory.
    pub fn new(
        home: &Path,
        nwid: u64,
        mac: Mac,
        mtu: u16,
        handler: FrameHandler,
    ) -> Result<Tap, TapError> {
        let stack = LwipStack::load(&home.join(STACK_LIB_RELPATH))?;
        Tap::with_stack(nwid, mac, mtu, Box::new(stack), handler)
    }

    /// Start a tap on an already constructed stack implementation.
    pub fn with_stack(
        nwid: u64,
        mac: Mac,
        mtu: u16,
        stack: Box<dyn Stack>,
        handler: FrameHandler,
    ) -> Result<Tap, TapError> {
        let dev = PathBuf::from(format!("/tmp/.ztnc_{:016x}", nwid));
        // A dead service may have left its rendezvous behind.
        let _ = std::fs::remove_file(&dev);
        let listener = UnixListener::bind(&dev).map_err(|e| TapError::ControlBind {
            path: dev.clone(),
            source: e,
        })?;
        listener.set_nonblocking(true)?;

        let (waker, waker_rx) = Waker::pair()?;
        let core = Core::new(stack, handler, nwid, waker.try_clone()?);
        let shared = Arc::new(Shared {
            nwid,
            mac,
            mtu,
            dev,
            ips: Mutex::new(Vec::new()),
            core: Mutex::new(core),
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            waker,
        });
        let thread = thread::Builder::new()
            .name("netcon-tap".to_string())
            .spawn({
                let shared = shared.clone();
                move || reactor(shared, listener, waker_rx)
            })?;
        tracing::info!(path = %shared.dev.display(), "tap started");
        Ok(Tap {
            shared,
            thread: Some(thread),
        })
    }

    /// Assign an address. The first v4 address installs the tap interface
    /// and becomes the address `BIND` requests resolve to.
    pub fn add_ip(&self, ip: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        let mut ips = self.shared.ips.lock().unwrap();
        if ips.contains(&ip) {
            return true;
        }
        ips.push(ip);
        ips.sort();
        let first = ips.len() == 1;

        let mut core = self.shared.core.lock().unwrap();
        core.bind_ip = ips.first().copied();
        if first {
            let cfg = NetifConfig {
                ip,
                netmask,
                gateway: DEFAULT_GATEWAY,
                mac: self.shared.mac,
                mtu: self.shared.mtu,
            };
            if let Err(e) = core.stack.netif_add(cfg) {
                tracing::error!(?e, "unable to install tap interface");
                core.bind_ip = None;
                drop(core);
                ips.retain(|&x| x != ip);
                return false;
            }
            core.drain_events();
        }
        true
    }

    pub fn remove_ip(&self, ip: Ipv4Addr) -> bool {
        let mut ips = self.shared.ips.lock().unwrap();
        let Some(pos) = ips.iter().position(|&x| x == ip) else {
            return false;
        };
        ips.remove(pos);
        self.shared.core.lock().unwrap().bind_ip = ips.first().copied();
        true
    }

    pub fn ips(&self) -> Vec<Ipv4Addr> {
        self.shared.ips.lock().unwrap().clone()
    }

    /// Deliver one inbound frame from the overlay fabric.
    pub fn put(&self, from: Mac, to: Mac, ethertype: u16, data: &[u8]) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut frame = Vec::with_capacity(eth::ETH_HDR_LEN + data.len());
        frame.extend_from_slice(&eth::build_eth_header(to, from, ethertype));
        frame.extend_from_slice(data);

        let mut core = self.shared.core.lock().unwrap();
        if let Err(e) = core.stack.netif_input(&frame) {
            core.rx_dropped += 1;
            tracing::debug!(?e, dropped = core.rx_dropped, "inbound frame dropped");
        }
        // Callbacks triggered by the frame run here, before the lock drops.
        core.drain_events();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// The control rendezvous path doubles as the device name.
    pub fn device_name(&self) -> String {
        self.shared.dev.display().to_string()
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.dev
    }

    pub fn nwid(&self) -> u64 {
        self.shared.nwid
    }

    pub fn mac(&self) -> Mac {
        self.shared.mac
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        // Twice: the reactor may be mid-iteration on the first.
        self.shared.waker.wake();
        self.shared.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.shared.dev);
    }
}

fn pollfd(fd: RawFd, events: i16) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn reactor(shared: Arc<Shared>, listener: UnixListener, waker_rx: UnixStream) {
    tracing::debug!(path = %shared.dev.display(), "reactor started");
    let mut last_tcp = Instant::now();
    let mut last_arp = Instant::now();

    while shared.running.load(Ordering::SeqCst) {
        let now = Instant::now();
        {
            let mut core = shared.core.lock().unwrap();
            if now.duration_since(last_tcp) >= TCP_TIMER_INTERVAL {
                last_tcp = now;
                core.stack.tcp_tmr();
            }
            if now.duration_since(last_arp) >= ARP_TIMER_INTERVAL {
                last_arp = now;
                core.stack.etharp_tmr();
            }
            core.drain_events();
        }

        // Sleep no longer than the nearer timer deadline.
        let tcp_left = TCP_TIMER_INTERVAL.saturating_sub(last_tcp.elapsed());
        let arp_left = ARP_TIMER_INTERVAL.saturating_sub(last_arp.elapsed());
        let timeout_ms = tcp_left.min(arp_left).as_millis().max(1) as libc::c_int;

        // Snapshot the descriptor set: listener, waker, every control
        // channel, and each data endpoint that is currently watched.
        let mut fds = vec![
            pollfd(listener.as_raw_fd(), libc::POLLIN),
            pollfd(waker_rx.as_raw_fd(), libc::POLLIN),
        ];
        let mut client_ids: Vec<SlotId> = Vec::new();
        let mut conn_ids: Vec<SlotId> = Vec::new();
        {
            let core = shared.core.lock().unwrap();
            for (id, client) in core.clients.iter() {
                client_ids.push(id);
                fds.push(pollfd(client.stream.as_raw_fd(), libc::POLLIN));
            }
            for (id, conn) in core.conns.iter() {
                let mut events = 0i16;
                if conn.notify_readable {
                    events |= libc::POLLIN;
                }
                if !conn.rx_pending.is_empty() {
                    events |= libc::POLLOUT;
                }
                if events != 0 {
                    conn_ids.push(id);
                    fds.push(pollfd(conn.data.as_raw_fd(), events));
                }
            }
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "poll failed");
            break;
        }

        if fds[1].revents != 0 {
            drain_waker(&waker_rx);
        }
        if fds[0].revents & libc::POLLIN != 0 {
            accept_clients(&shared, &listener);
        }

        let base = 2;
        for (i, &id) in client_ids.iter().enumerate() {
            let revents = fds[base + i].revents;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                service_client(&shared, id);
            }
        }
        let cbase = base + client_ids.len();
        for (i, &id) in conn_ids.iter().enumerate() {
            let revents = fds[cbase + i].revents;
            if revents == 0 || revents & libc::POLLNVAL != 0 {
                continue;
            }
            let mut core = shared.core.lock().unwrap();
            if revents & libc::POLLOUT != 0 {
                core.flush_rx_pending(id);
            }
            if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
                // A hangup still drains buffered bytes; the pump closes the
                // connection when the endpoint reads empty.
                core.pump_outbound(id);
            }
            if revents & libc::POLLERR != 0 {
                core.close_conn(id);
            }
            core.drain_events();
        }
    }

    shared.core.lock().unwrap().close_all();
    tracing::debug!("reactor stopped");
}

fn drain_waker(rx: &UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match (&*rx).read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

fn accept_clients(shared: &Arc<Shared>, listener: &UnixListener) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::debug!(error = %e, "set_nonblocking on control channel");
                }
                let mut core = shared.core.lock().unwrap();
                let id = core.clients.insert(Client::new(stream));
                tracing::debug!(client = ?id, "client connected");
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::error!(error = %e, "accept on control rendezvous failed");
                return;
            }
        }
    }
}

/// Read available control bytes and dispatch every complete record.
fn service_client(shared: &Arc<Shared>, id: SlotId) {
    let mut core = shared.core.lock().unwrap();
    let mut disconnect = false;
    {
        let Some(client) = core.clients.get_mut(id) else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match (&client.stream).read(&mut buf) {
                Ok(0) => {
                    disconnect = true;
                    break;
                }
                Ok(n) => client.rxbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "control channel read failed");
                    disconnect = true;
                    break;
                }
            }
        }
    }

    loop {
        let record = {
            let Some(client) = core.clients.get_mut(id) else {
                return;
            };
            let Some(&tag) = client.rxbuf.first() else {
                break;
            };
            let Some(len) = proto::payload_len(tag) else {
                tracing::error!(tag, "unknown rpc tag; dropping client");
                disconnect = true;
                break;
            };
            if client.rxbuf.len() < 1 + len {
                break;
            }
            let record = proto::Request::decode(tag, &client.rxbuf[1..1 + len]);
            client.rxbuf.drain(..1 + len);
            record
        };
        match record {
            Ok(req) => core.dispatch(id, req),
            Err(e) => {
                tracing::error!(error = %e, "malformed rpc; dropping client");
                disconnect = true;
                break;
            }
        }
    }

    if disconnect {
        core.close_client(id);
    }
}
