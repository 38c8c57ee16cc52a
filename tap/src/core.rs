//! The connection multiplexer.
//!
//! Everything mutable — the stack facade, both registries, all
//! per-connection state — lives in [`Core`] behind one mutex. The reactor
//! locks it to dispatch RPCs, pump data and fire timers; the fabric's frame
//! delivery locks it to inject frames. Stack callbacks surface as
//! [`StackEvent`]s and are drained before the lock is released, so they see
//! the same single-threaded world the original callbacks would.

use crate::conn::{by_perceived, Client, Conn};
use crate::eth::{self, Mac};
use crate::fdpass;
use crate::slots::{SlotId, Slots};
use crate::stack::{Pcb, PcbState, Stack, StackError, StackEvent};
use netcon_proto::{Request, Retval};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

/// Byte written into the listening data endpoint when a connection is
/// accepted; the intercept library's `accept()` blocks reading it before
/// collecting the transferred descriptor.
pub(crate) const ACCEPT_SENTINEL: u8 = b'z';

/// Cap on bytes staged per connection between the data endpoint and the
/// stack's send buffer.
const SEND_STAGING_CAP: usize = 64 * 1024;

/// Outbound frame sink supplied by the overlay fabric:
/// `(nwid, src_mac, dst_mac, ethertype, vlan, payload)`.
pub type FrameHandler = Box<dyn FnMut(u64, Mac, Mac, u16, u16, &[u8]) + Send>;

/// Wakes the reactor out of its poll.
pub(crate) struct Waker {
    tx: UnixStream,
}

impl Waker {
    pub fn pair() -> io::Result<(Waker, UnixStream)> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok((Waker { tx }, rx))
    }

    pub fn try_clone(&self) -> io::Result<Waker> {
        Ok(Waker {
            tx: self.tx.try_clone()?,
        })
    }

    pub fn wake(&self) {
        let _ = (&self.tx).write(&[1u8]);
    }
}

pub(crate) struct Core {
    pub stack: Box<dyn Stack>,
    pub clients: Slots<Client>,
    pub conns: Slots<Conn>,
    pub handler: FrameHandler,
    pub nwid: u64,
    /// Primary assigned v4 address; `BIND` targets this, never the
    /// client-supplied one.
    pub bind_ip: Option<Ipv4Addr>,
    pub waker: Waker,
    pub rx_dropped: u64,
}

impl Core {
    pub fn new(stack: Box<dyn Stack>, handler: FrameHandler, nwid: u64, waker: Waker) -> Core {
        Core {
            stack,
            clients: Slots::new(),
            conns: Slots::new(),
            handler,
            nwid,
            bind_ip: None,
            waker,
            rx_dropped: 0,
        }
    }

    /// Run queued stack callbacks to completion, in delivery order.
    pub fn drain_events(&mut self) {
        while let Some(ev) = self.stack.poll_event() {
            self.on_event(ev);
        }
    }

    pub fn dispatch(&mut self, client: SlotId, req: Request) {
        match req {
            Request::Socket {
                domain,
                stype,
                protocol,
            } => self.handle_socket(client, domain, stype, protocol),
            Request::Bind { their_fd, addr } => self.handle_bind(client, their_fd, addr),
            Request::Listen { their_fd, backlog } => {
                self.handle_listen(client, their_fd, backlog)
            }
            Request::Connect { their_fd, addr } => self.handle_connect(client, their_fd, addr),
            Request::FdMapCompletion { perceived_fd } => {
                self.handle_fd_map(client, perceived_fd)
            }
            Request::KillIntercept => {
                tracing::debug!("kill-intercept request ignored");
            }
        }
        self.drain_events();
    }

    fn handle_socket(&mut self, client: SlotId, _domain: i32, _stype: i32, _protocol: i32) {
        let Some(pcb) = self.stack.tcp_new() else {
            tracing::error!("no memory for new pcb");
            self.reply_channel(client, -1, libc::ENOMEM);
            return;
        };
        let (ours, theirs) = match fdpass::socketpair_stream() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "socketpair failed");
                if let Err(err) = self.stack.tcp_close(pcb) {
                    tracing::debug!(?err, "tcp_close after socketpair failure");
                }
                let errno = e.raw_os_error().unwrap_or(libc::ENOMEM);
                self.reply_channel(client, -1, errno);
                return;
            }
        };
        let data = UnixStream::from(ours);
        if let Err(e) = data.set_nonblocking(true) {
            tracing::debug!(error = %e, "set_nonblocking on data endpoint");
        }
        let mut conn = Conn::new(pcb, data, client);
        conn.their_fd = Some(theirs);
        let id = self.conns.insert(conn);

        let ctl_fd = self.clients.get_mut(client).map(|cl| {
            cl.pending_maps.push_back(id);
            cl.stream.as_raw_fd()
        });
        let Some(ctl_fd) = ctl_fd else {
            self.close_conn(id);
            return;
        };
        let theirs_fd = self
            .conns
            .get(id)
            .and_then(|c| c.their_fd.as_ref())
            .map(|f| f.as_raw_fd())
            .expect("peer descriptor just stored");
        if let Err(e) = fdpass::send_fd(ctl_fd, theirs_fd) {
            tracing::error!(error = %e, "unable to transfer descriptor to client");
            self.close_conn(id);
        }
        // The mapping completes when the client reports the descriptor
        // number it assigned.
    }

    fn handle_bind(&mut self, client: SlotId, their_fd: i32, addr: SocketAddrV4) {
        let Some(id) = by_perceived(&self.conns, client, their_fd) else {
            tracing::debug!(their_fd, "bind: no connection for descriptor");
            self.reply_channel(client, -1, libc::EBADF);
            return;
        };
        let pcb = self.conns.get(id).map(|c| c.pcb).expect("just looked up");
        match self.stack.state(pcb) {
            PcbState::Closed => {
                // The overlay only owns its assigned addresses, so the
                // client-supplied address is ignored in favor of the tap's
                // primary one; bind(INADDR_ANY) and bind(<assigned>) are
                // equivalent here.
                let Some(ip) = self.bind_ip else {
                    self.send_retval(id, -1, libc::EADDRNOTAVAIL);
                    return;
                };
                match self.stack.tcp_bind(pcb, ip, addr.port()) {
                    Ok(()) => {
                        self.send_retval(id, 0, 0);
                    }
                    Err(StackError::Use) => {
                        self.send_retval(id, -1, libc::EADDRINUSE);
                    }
                    Err(StackError::Mem) | Err(StackError::Buf) => {
                        self.send_retval(id, -1, libc::ENOMEM);
                    }
                    Err(e) => {
                        self.send_retval(id, -1, e.errno());
                    }
                }
            }
            _ => {
                tracing::debug!("bind on non-closed pcb");
                self.send_retval(id, -1, libc::EINVAL);
            }
        }
    }

    fn handle_listen(&mut self, client: SlotId, their_fd: i32, backlog: i32) {
        let Some(id) = by_perceived(&self.conns, client, their_fd) else {
            tracing::debug!(their_fd, "listen: no connection for descriptor");
            self.reply_channel(client, -1, libc::EBADF);
            return;
        };
        let pcb = self.conns.get(id).map(|c| c.pcb).expect("just looked up");
        if self.stack.state(pcb) == PcbState::Listen {
            return;
        }
        match self.stack.tcp_listen(pcb, backlog) {
            Some(lpcb) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.pcb = lpcb;
                }
                self.stack.install_accept(lpcb, id);
                if self.send_retval(id, 0, 0) {
                    // The next reply on this connection belongs to the
                    // accept handshake.
                    if let Some(conn) = self.conns.get_mut(id) {
                        conn.pending = true;
                    }
                }
            }
            None => {
                tracing::error!("no memory for listening pcb");
                self.send_retval(id, -1, libc::ENOMEM);
            }
        }
    }

    fn handle_connect(&mut self, client: SlotId, their_fd: i32, addr: SocketAddrV4) {
        let Some(id) = by_perceived(&self.conns, client, their_fd) else {
            tracing::debug!(their_fd, "connect: no connection for descriptor");
            self.reply_channel(client, -1, libc::EBADF);
            return;
        };
        let pcb = self.conns.get(id).map(|c| c.pcb).expect("just looked up");
        self.stack.install_callbacks(pcb, id);
        match self.stack.tcp_connect(pcb, *addr.ip(), addr.port()) {
            Ok(()) => {
                // Success here only means the open was enqueued; the
                // connected or error callback delivers the reply.
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.pending = true;
                }
            }
            Err(StackError::Use) => {
                self.send_retval(id, -1, libc::EISCONN);
            }
            Err(StackError::Val) => {
                self.send_retval(id, -1, libc::EAFNOSUPPORT);
            }
            Err(StackError::Rte) => {
                self.send_retval(id, -1, libc::ENETUNREACH);
            }
            Err(e) => {
                tracing::debug!(?e, "connect failed");
                self.send_retval(id, -1, e.errno());
            }
        }
    }

    fn handle_fd_map(&mut self, client: SlotId, perceived_fd: i32) {
        let Some(cl) = self.clients.get_mut(client) else {
            return;
        };
        let Some(id) = cl.pending_maps.pop_front() else {
            tracing::debug!(perceived_fd, "descriptor mapping with nothing pending");
            return;
        };
        if let Some(conn) = self.conns.get_mut(id) {
            if conn.pending {
                conn.perceived_fd = Some(perceived_fd);
                conn.pending = false;
                // The client owns its half now; release ours.
                conn.their_fd = None;
            }
        }
    }

    /// Send one `RETVAL` on the connection's control channel. Failure to
    /// deliver closes the connection.
    fn send_retval(&mut self, id: SlotId, retval: i32, errno: i32) -> bool {
        let Some(conn) = self.conns.get(id) else {
            return false;
        };
        let client = conn.client;
        let rec = Retval { retval, errno }.encode();
        let wrote = match self.clients.get_mut(client) {
            Some(cl) => (&cl.stream).write(&rec).map(|n| n == rec.len()).unwrap_or(false),
            None => {
                tracing::debug!("reply with no control channel; closing connection");
                false
            }
        };
        if wrote {
            if let Some(conn) = self.conns.get_mut(id) {
                conn.pending = false;
            }
            true
        } else {
            tracing::error!("unable to send return value; closing connection");
            self.close_conn(id);
            false
        }
    }

    /// Reply on a control channel with no connection involved.
    fn reply_channel(&mut self, client: SlotId, retval: i32, errno: i32) {
        let rec = Retval { retval, errno }.encode();
        let ok = match self.clients.get_mut(client) {
            Some(cl) => (&cl.stream).write(&rec).map(|n| n == rec.len()).unwrap_or(false),
            None => true,
        };
        if !ok {
            self.close_client(client);
        }
    }

    fn on_event(&mut self, ev: StackEvent) {
        match ev {
            StackEvent::Accepted { listener, new_pcb } => self.on_accepted(listener, new_pcb),
            StackEvent::Recved { conn, data } => match data {
                None => {
                    tracing::debug!("remote closed; closing connection");
                    self.close_conn(conn);
                }
                Some(segs) => self.on_recved(conn, segs),
            },
            StackEvent::Sent { conn, len } => {
                if len > 0 {
                    if let Some(c) = self.conns.get_mut(conn) {
                        c.notify_readable = true;
                        self.waker.wake();
                    }
                }
            }
            StackEvent::Connected { conn } => {
                self.send_retval(conn, 0, 0);
            }
            StackEvent::Errored { conn, err } => self.on_errored(conn, err),
            StackEvent::Poll { .. } => {
                // Idle tick; reserved for write draining.
            }
            StackEvent::FrameOut { frame } => {
                let Some((dst, src, ethertype, payload)) = eth::parse_frame(&frame) else {
                    tracing::debug!("malformed frame from stack");
                    return;
                };
                (self.handler)(self.nwid, src, dst, ethertype, 0, payload);
            }
        }
    }

    fn on_accepted(&mut self, listener: SlotId, new_pcb: Pcb) {
        let Some(lconn) = self.conns.get(listener) else {
            tracing::debug!("accept callback for stale listener");
            self.stack.detach_callbacks(new_pcb);
            let _ = self.stack.tcp_close(new_pcb);
            return;
        };
        let client = lconn.client;
        let listener_pcb = lconn.pcb;

        let (ours, theirs) = match fdpass::socketpair_stream() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "socketpair failed in accept");
                let _ = self.stack.tcp_close(new_pcb);
                self.send_retval(listener, -1, e.raw_os_error().unwrap_or(libc::ENOMEM));
                return;
            }
        };

        // Sentinel first: the client's accept() is blocked reading the
        // listening endpoint and collects the descriptor afterwards.
        let sentinel_ok = match self.conns.get(listener) {
            Some(l) => (&l.data).write(&[ACCEPT_SENTINEL]).is_ok(),
            None => false,
        };
        if !sentinel_ok {
            tracing::error!("unable to write accept sentinel");
            let _ = self.stack.tcp_close(new_pcb);
            return;
        }

        let data = UnixStream::from(ours);
        if let Err(e) = data.set_nonblocking(true) {
            tracing::debug!(error = %e, "set_nonblocking on accepted endpoint");
        }
        let mut conn = Conn::new(new_pcb, data, client);
        conn.their_fd = Some(theirs);
        let id = self.conns.insert(conn);
        self.stack.install_callbacks(new_pcb, id);

        let ctl_fd = match self.clients.get_mut(client) {
            Some(cl) => {
                cl.pending_maps.push_back(id);
                Some(cl.stream.as_raw_fd())
            }
            None => None,
        };
        let theirs_fd = self
            .conns
            .get(id)
            .and_then(|c| c.their_fd.as_ref())
            .map(|f| f.as_raw_fd());
        match (ctl_fd, theirs_fd) {
            (Some(ctl), Some(fd)) => {
                if let Err(e) = fdpass::send_fd(ctl, fd) {
                    tracing::error!(error = %e, "unable to transfer accepted descriptor");
                    self.close_conn(id);
                }
            }
            _ => {
                tracing::debug!("accepted connection without control channel");
                self.close_conn(id);
            }
        }
        self.stack.tcp_accepted(listener_pcb);
    }

    fn on_recved(&mut self, id: SlotId, segs: Vec<Vec<u8>>) {
        for seg in segs {
            if seg.is_empty() {
                continue;
            }
            if !self.deliver_inbound(id, &seg) {
                return;
            }
        }
    }

    /// Hand inbound bytes to the data endpoint, advancing the receive
    /// window only for bytes actually delivered. Returns false if the
    /// connection was torn down.
    fn deliver_inbound(&mut self, id: SlotId, seg: &[u8]) -> bool {
        let Some(conn) = self.conns.get_mut(id) else {
            return false;
        };
        if !conn.rx_pending.is_empty() {
            conn.rx_pending.extend_from_slice(seg);
            return true;
        }
        let pcb = conn.pcb;
        match (&conn.data).write(seg) {
            Ok(n) => {
                if n > 0 {
                    self.stack.tcp_recved(pcb, n);
                }
                if n < seg.len() {
                    tracing::debug!(short = seg.len() - n, "short write to data endpoint");
                    conn.rx_pending.extend_from_slice(&seg[n..]);
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.rx_pending.extend_from_slice(seg);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "data endpoint write failed; closing");
                self.close_conn(id);
                false
            }
        }
    }

    /// Drain buffered inbound bytes once the data endpoint is writable
    /// again.
    pub fn flush_rx_pending(&mut self, id: SlotId) {
        loop {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            if conn.rx_pending.is_empty() {
                return;
            }
            let pcb = conn.pcb;
            let res = (&conn.data).write(&conn.rx_pending);
            match res {
                Ok(0) => return,
                Ok(n) => {
                    conn.rx_pending.drain(..n);
                    self.stack.tcp_recved(pcb, n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::debug!(error = %e, "data endpoint write failed; closing");
                    self.close_conn(id);
                    return;
                }
            }
        }
    }

    /// Move client bytes toward the stack while the send buffer has room.
    pub fn pump_outbound(&mut self, id: SlotId) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };
        let pcb = conn.pcb;
        let free = self.stack.snd_buf(pcb);
        if free == 0 {
            // Stop watching the endpoint until the stack acks something.
            if let Some(c) = self.conns.get_mut(id) {
                c.notify_readable = false;
            }
            self.stack.tcp_output(pcb);
            return;
        }

        // Staged leftovers go first.
        {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            if !conn.staged.is_empty() {
                let chunk = conn.staged.len().min(free);
                match self.stack.tcp_write(pcb, &conn.staged[..chunk]) {
                    Ok(()) => {
                        conn.staged.drain(..chunk);
                    }
                    Err(e) => {
                        tracing::debug!(?e, "stack rejected staged bytes");
                        conn.notify_readable = false;
                        self.stack.tcp_output(pcb);
                        return;
                    }
                }
            }
        }

        let free = self.stack.snd_buf(pcb);
        if free == 0 {
            if let Some(c) = self.conns.get_mut(id) {
                c.notify_readable = false;
            }
            self.stack.tcp_output(pcb);
            return;
        }

        let mut buf = vec![0u8; free.min(SEND_STAGING_CAP)];
        let read_res = {
            let Some(conn) = self.conns.get_mut(id) else {
                return;
            };
            (&conn.data).read(&mut buf)
        };
        match read_res {
            Ok(0) => {
                // Client closed its half.
                self.close_conn(id);
            }
            Ok(n) => match self.stack.tcp_write(pcb, &buf[..n]) {
                Ok(()) => {}
                Err(e) => {
                    tracing::debug!(?e, "stack rejected write; staging");
                    if let Some(conn) = self.conns.get_mut(id) {
                        conn.staged.extend_from_slice(&buf[..n]);
                        conn.notify_readable = false;
                    }
                    self.stack.tcp_output(pcb);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "data endpoint read failed; closing");
                self.close_conn(id);
            }
        }
    }

    fn on_errored(&mut self, id: SlotId, err: StackError) {
        match self.conns.get_mut(id) {
            // The stack freed the PCB before delivering this.
            Some(conn) => conn.pcb_dead = true,
            None => {
                tracing::debug!("error callback for stale connection handle");
                return;
            }
        }
        tracing::debug!(errno = err.errno(), "stack error; closing connection");
        self.send_retval(id, -1, err.errno());
        self.close_conn(id);
    }

    /// Tear down a connection: detach its callbacks, close the PCB, drop
    /// both socket-pair halves, remove it from the registry.
    pub fn close_conn(&mut self, id: SlotId) {
        let Some(conn) = self.conns.remove(id) else {
            return;
        };
        if conn.pcb_dead {
            self.stack.pcb_gone(conn.pcb);
        } else {
            self.stack.detach_callbacks(conn.pcb);
            if let Err(e) = self.stack.tcp_close(conn.pcb) {
                tracing::debug!(?e, "tcp_close failed");
            }
        }
        if let Some(cl) = self.clients.get_mut(conn.client) {
            cl.pending_maps.retain(|&m| m != id);
        }
        // The data endpoint and any retained peer descriptor close as
        // `conn` drops.
    }

    /// Drop a control channel. Its connections keep running; each holds a
    /// weak handle and is torn down if it ever needs the absent channel.
    pub fn close_client(&mut self, id: SlotId) {
        if self.clients.remove(id).is_some() {
            tracing::debug!("client disconnected");
        }
    }

    pub fn close_all(&mut self) {
        for id in self.clients.ids() {
            self.close_client(id);
        }
        for id in self.conns.ids() {
            self.close_conn(id);
        }
    }
}
