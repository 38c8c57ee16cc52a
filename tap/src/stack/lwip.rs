//! Binding to the dynamically loaded lwIP stack.
//!
//! The stack ships as a shared object and is opened at runtime; nothing here
//! links against it. C callbacks land in trampolines that record the event
//! and return immediately; the wrapper drains those records into
//! [`StackEvent`]s after every entry into the library, on the calling thread,
//! so the service sees callbacks in delivery order without the stack ever
//! being re-entered.
//!
//! The PCB pointer stays fully opaque. Send-buffer headroom and the
//! coarse PCB state are mirrored on this side of the ABI (updated from
//! `tcp_write` results and `sent` callbacks) instead of reading fields out of
//! the library's private structs.

use super::{NetifConfig, Pcb, PcbState, Stack, StackError, StackEvent};
use crate::error::TapError;
use crate::slots::SlotId;
use libloading::Library;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::os::raw::{c_char, c_void};
use std::path::Path;
use std::ptr;

/// Stack library location relative to the service home directory.
pub const STACK_LIB_RELPATH: &str = "ext/liblwip.so";

type ErrT = i8;

const ERR_OK: ErrT = 0;
const ERR_MEM: ErrT = -1;
const ERR_BUF: ErrT = -2;
const ERR_TIMEOUT: ErrT = -3;
const ERR_RTE: ErrT = -4;
const ERR_INPROGRESS: ErrT = -5;
const ERR_VAL: ErrT = -6;
const ERR_WOULDBLOCK: ErrT = -7;
const ERR_USE: ErrT = -8;
const ERR_ISCONN: ErrT = -9;
const ERR_ABRT: ErrT = -10;
const ERR_RST: ErrT = -11;
const ERR_CLSD: ErrT = -12;
const ERR_CONN: ErrT = -13;
const ERR_ARG: ErrT = -14;

fn map_err(err: ErrT) -> StackError {
    match err {
        ERR_MEM => StackError::Mem,
        ERR_BUF => StackError::Buf,
        ERR_TIMEOUT => StackError::Timeout,
        ERR_RTE => StackError::Rte,
        ERR_INPROGRESS => StackError::InProgress,
        ERR_VAL => StackError::Val,
        ERR_WOULDBLOCK => StackError::WouldBlock,
        ERR_USE => StackError::Use,
        ERR_ISCONN => StackError::IsConn,
        ERR_ABRT => StackError::Abrt,
        ERR_RST => StackError::Rst,
        ERR_CLSD => StackError::Clsd,
        ERR_CONN => StackError::Conn,
        ERR_ARG => StackError::Arg,
        _ => StackError::If,
    }
}

// pbuf allocation arguments: PBUF_RAW layer, PBUF_POOL storage.
const PBUF_RAW: i32 = 3;
const PBUF_POOL: i32 = 3;

const TCP_WRITE_FLAG_COPY: u8 = 0x01;

const NETIF_FLAG_BROADCAST: u8 = 0x02;
const NETIF_FLAG_ETHARP: u8 = 0x20;
const NETIF_FLAG_IGMP: u8 = 0x80;

/// Shadowed send-buffer capacity. Must not exceed the `TCP_SND_BUF` the
/// stack library was built with.
const TCP_SND_BUF_BYTES: usize = 32 * 1024;

const POLL_INTERVAL_TICKS: u8 = 1;
const LISTEN_BACKLOG_MAX: i32 = 0xff;

#[repr(C)]
struct RawPbuf {
    next: *mut RawPbuf,
    payload: *mut c_void,
    tot_len: u16,
    len: u16,
    kind: u8,
    flags: u8,
    refcnt: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawIp4 {
    addr: u32,
}

impl RawIp4 {
    fn from(ip: Ipv4Addr) -> RawIp4 {
        RawIp4 {
            addr: u32::from_ne_bytes(ip.octets()),
        }
    }
}

/// PCB handles are opaque pointers into the library.
enum RawTcpPcb {}

type NetifInputFn = unsafe extern "C" fn(*mut RawPbuf, *mut RawNetif) -> ErrT;
type NetifOutputFn = unsafe extern "C" fn(*mut RawNetif, *mut RawPbuf, *mut RawIp4) -> ErrT;
type NetifLinkoutputFn = unsafe extern "C" fn(*mut RawNetif, *mut RawPbuf) -> ErrT;
type NetifInitFn = unsafe extern "C" fn(*mut RawNetif) -> ErrT;

type TcpAcceptFn = unsafe extern "C" fn(*mut c_void, *mut RawTcpPcb, ErrT) -> ErrT;
type TcpRecvFn = unsafe extern "C" fn(*mut c_void, *mut RawTcpPcb, *mut RawPbuf, ErrT) -> ErrT;
type TcpSentFn = unsafe extern "C" fn(*mut c_void, *mut RawTcpPcb, u16) -> ErrT;
type TcpErrFn = unsafe extern "C" fn(*mut c_void, ErrT);
type TcpPollFn = unsafe extern "C" fn(*mut c_void, *mut RawTcpPcb) -> ErrT;
type TcpConnectedFn = unsafe extern "C" fn(*mut c_void, *mut RawTcpPcb, ErrT) -> ErrT;

/// Network interface record shared with the library. Field order matches the
/// bundled stack build (default option set: no DHCP/AutoIP/hostname/status
/// callback compiled in).
#[repr(C)]
struct RawNetif {
    next: *mut RawNetif,
    ip_addr: RawIp4,
    netmask: RawIp4,
    gw: RawIp4,
    input: Option<NetifInputFn>,
    output: Option<NetifOutputFn>,
    linkoutput: Option<NetifLinkoutputFn>,
    state: *mut c_void,
    mtu: u16,
    hwaddr_len: u8,
    hwaddr: [u8; 6],
    flags: u8,
    name: [c_char; 2],
    num: u8,
}

/// Resolved entry points, loaded once at startup.
struct Api {
    lwip_init: unsafe extern "C" fn(),
    tcp_new: unsafe extern "C" fn() -> *mut RawTcpPcb,
    tcp_bind: unsafe extern "C" fn(*mut RawTcpPcb, *mut RawIp4, u16) -> ErrT,
    tcp_listen_with_backlog: unsafe extern "C" fn(*mut RawTcpPcb, u8) -> *mut RawTcpPcb,
    tcp_accept: unsafe extern "C" fn(*mut RawTcpPcb, Option<TcpAcceptFn>),
    tcp_connect:
        unsafe extern "C" fn(*mut RawTcpPcb, *mut RawIp4, u16, Option<TcpConnectedFn>) -> ErrT,
    tcp_write: unsafe extern "C" fn(*mut RawTcpPcb, *const c_void, u16, u8) -> ErrT,
    tcp_output: unsafe extern "C" fn(*mut RawTcpPcb) -> ErrT,
    tcp_recved: unsafe extern "C" fn(*mut RawTcpPcb, u16),
    tcp_close: unsafe extern "C" fn(*mut RawTcpPcb) -> ErrT,
    tcp_arg: unsafe extern "C" fn(*mut RawTcpPcb, *mut c_void),
    tcp_recv: unsafe extern "C" fn(*mut RawTcpPcb, Option<TcpRecvFn>),
    tcp_sent: unsafe extern "C" fn(*mut RawTcpPcb, Option<TcpSentFn>),
    tcp_err: unsafe extern "C" fn(*mut RawTcpPcb, Option<TcpErrFn>),
    tcp_poll: unsafe extern "C" fn(*mut RawTcpPcb, Option<TcpPollFn>, u8),
    tcp_tmr: unsafe extern "C" fn(),
    etharp_tmr: unsafe extern "C" fn(),
    netif_add: unsafe extern "C" fn(
        *mut RawNetif,
        *mut RawIp4,
        *mut RawIp4,
        *mut RawIp4,
        *mut c_void,
        Option<NetifInitFn>,
        Option<NetifInputFn>,
    ) -> *mut RawNetif,
    netif_set_default: unsafe extern "C" fn(*mut RawNetif),
    netif_set_up: unsafe extern "C" fn(*mut RawNetif),
    ethernet_input: NetifInputFn,
    etharp_output: NetifOutputFn,
    pbuf_alloc: unsafe extern "C" fn(i32, u16, i32) -> *mut RawPbuf,
    pbuf_free: unsafe extern "C" fn(*mut RawPbuf) -> u8,
}

/// Raw callback records queued by the trampolines while a library entry
/// point runs; converted to [`StackEvent`]s (and pbufs released) as soon as
/// the entry point returns, still on the same thread.
enum RawEvent {
    Accepted { arg: usize, new_pcb: usize },
    Recved { arg: usize, pbuf: *mut RawPbuf },
    Sent { arg: usize, pcb: usize, len: u16 },
    Connected { arg: usize },
    Errored { arg: usize, err: ErrT },
    Poll { arg: usize },
    FrameOut { frame: Vec<u8> },
}

thread_local! {
    static RAW_EVENTS: RefCell<Vec<RawEvent>> = const { RefCell::new(Vec::new()) };
    static NETIF_INIT: Cell<Option<NetifInitCtx>> = const { Cell::new(None) };
}

fn push_raw(ev: RawEvent) {
    RAW_EVENTS.with(|q| q.borrow_mut().push(ev));
}

#[derive(Clone, Copy)]
struct NetifInitCtx {
    output: NetifOutputFn,
    mac: [u8; 6],
    mtu: u16,
}

unsafe extern "C" fn accept_tramp(arg: *mut c_void, newpcb: *mut RawTcpPcb, err: ErrT) -> ErrT {
    if err == ERR_OK && !newpcb.is_null() && !arg.is_null() {
        push_raw(RawEvent::Accepted {
            arg: arg as usize,
            new_pcb: newpcb as usize,
        });
    }
    ERR_OK
}

unsafe extern "C" fn recv_tramp(
    arg: *mut c_void,
    _pcb: *mut RawTcpPcb,
    p: *mut RawPbuf,
    _err: ErrT,
) -> ErrT {
    if !arg.is_null() {
        push_raw(RawEvent::Recved {
            arg: arg as usize,
            pbuf: p,
        });
    }
    ERR_OK
}

unsafe extern "C" fn sent_tramp(arg: *mut c_void, pcb: *mut RawTcpPcb, len: u16) -> ErrT {
    if !arg.is_null() {
        push_raw(RawEvent::Sent {
            arg: arg as usize,
            pcb: pcb as usize,
            len,
        });
    }
    ERR_OK
}

unsafe extern "C" fn err_tramp(arg: *mut c_void, err: ErrT) {
    if !arg.is_null() {
        push_raw(RawEvent::Errored {
            arg: arg as usize,
            err,
        });
    }
}

unsafe extern "C" fn poll_tramp(arg: *mut c_void, _pcb: *mut RawTcpPcb) -> ErrT {
    if !arg.is_null() {
        push_raw(RawEvent::Poll { arg: arg as usize });
    }
    ERR_OK
}

unsafe extern "C" fn connected_tramp(arg: *mut c_void, _pcb: *mut RawTcpPcb, err: ErrT) -> ErrT {
    if !arg.is_null() {
        if err == ERR_OK {
            push_raw(RawEvent::Connected { arg: arg as usize });
        } else {
            push_raw(RawEvent::Errored {
                arg: arg as usize,
                err,
            });
        }
    }
    ERR_OK
}

unsafe extern "C" fn linkoutput_tramp(_netif: *mut RawNetif, p: *mut RawPbuf) -> ErrT {
    // The caller frees the chain after we return; copy now.
    let frame = unsafe { copy_chain(p) };
    push_raw(RawEvent::FrameOut { frame });
    ERR_OK
}

unsafe extern "C" fn netif_init_tramp(netif: *mut RawNetif) -> ErrT {
    NETIF_INIT.with(|c| {
        if let Some(ctx) = c.take() {
            unsafe {
                (*netif).output = Some(ctx.output);
                (*netif).linkoutput = Some(linkoutput_tramp);
                (*netif).hwaddr = ctx.mac;
                (*netif).hwaddr_len = 6;
                (*netif).mtu = ctx.mtu;
                (*netif).name = [b'n' as c_char, b'c' as c_char];
                (*netif).flags = NETIF_FLAG_BROADCAST | NETIF_FLAG_ETHARP | NETIF_FLAG_IGMP;
            }
        }
    });
    ERR_OK
}

/// Coalesce a pbuf chain into contiguous bytes.
unsafe fn copy_chain(p: *mut RawPbuf) -> Vec<u8> {
    let mut out = Vec::new();
    unsafe {
        if !p.is_null() {
            out.reserve((*p).tot_len as usize);
        }
        let mut q = p;
        while !q.is_null() {
            let seg = std::slice::from_raw_parts((*q).payload as *const u8, (*q).len as usize);
            out.extend_from_slice(seg);
            q = (*q).next;
        }
    }
    out
}

struct PcbMeta {
    state: PcbState,
    snd_free: usize,
}

pub struct LwipStack {
    // Keeps the shared object mapped for the lifetime of `api`.
    _lib: Library,
    api: Api,
    netif: Box<RawNetif>,
    meta: HashMap<usize, PcbMeta>,
    events: VecDeque<StackEvent>,
}

// Raw pointers prevent the auto impl. Every entry into the library is
// serialized under the service's single lock and the library keeps no
// thread affinity.
unsafe impl Send for LwipStack {}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        unsafe {
            $lib.get(concat!($name, "\0").as_bytes())
                .map(|sym| *sym)
                .map_err(|_| TapError::StackSymbol($name.to_string()))?
        }
    };
}

impl LwipStack {
    /// Open the stack library at `path` and initialize it.
    pub fn load(path: &Path) -> Result<LwipStack, TapError> {
        let lib =
            unsafe { Library::new(path) }.map_err(|e| TapError::StackLoad(e.to_string()))?;
        let api = Api {
            lwip_init: resolve!(lib, "lwip_init"),
            tcp_new: resolve!(lib, "tcp_new"),
            tcp_bind: resolve!(lib, "tcp_bind"),
            tcp_listen_with_backlog: resolve!(lib, "tcp_listen_with_backlog"),
            tcp_accept: resolve!(lib, "tcp_accept"),
            tcp_connect: resolve!(lib, "tcp_connect"),
            tcp_write: resolve!(lib, "tcp_write"),
            tcp_output: resolve!(lib, "tcp_output"),
            tcp_recved: resolve!(lib, "tcp_recved"),
            tcp_close: resolve!(lib, "tcp_close"),
            tcp_arg: resolve!(lib, "tcp_arg"),
            tcp_recv: resolve!(lib, "tcp_recv"),
            tcp_sent: resolve!(lib, "tcp_sent"),
            tcp_err: resolve!(lib, "tcp_err"),
            tcp_poll: resolve!(lib, "tcp_poll"),
            tcp_tmr: resolve!(lib, "tcp_tmr"),
            etharp_tmr: resolve!(lib, "etharp_tmr"),
            netif_add: resolve!(lib, "netif_add"),
            netif_set_default: resolve!(lib, "netif_set_default"),
            netif_set_up: resolve!(lib, "netif_set_up"),
            ethernet_input: resolve!(lib, "ethernet_input"),
            etharp_output: resolve!(lib, "etharp_output"),
            pbuf_alloc: resolve!(lib, "pbuf_alloc"),
            pbuf_free: resolve!(lib, "pbuf_free"),
        };
        unsafe { (api.lwip_init)() };
        Ok(LwipStack {
            _lib: lib,
            api,
            netif: Box::new(unsafe { std::mem::zeroed() }),
            meta: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    /// Convert the trampoline records queued during the last library entry.
    fn drain_raw(&mut self) {
        let raw = RAW_EVENTS.with(|q| std::mem::take(&mut *q.borrow_mut()));
        for ev in raw {
            match ev {
                RawEvent::Accepted { arg, new_pcb } => {
                    self.meta.insert(
                        new_pcb,
                        PcbMeta {
                            state: PcbState::Active,
                            snd_free: TCP_SND_BUF_BYTES,
                        },
                    );
                    self.events.push_back(StackEvent::Accepted {
                        listener: SlotId::from_raw(arg),
                        new_pcb: Pcb(new_pcb),
                    });
                }
                RawEvent::Recved { arg, pbuf } => {
                    let data = if pbuf.is_null() {
                        None
                    } else {
                        let mut segs = Vec::new();
                        unsafe {
                            let mut q = pbuf;
                            while !q.is_null() {
                                let seg = std::slice::from_raw_parts(
                                    (*q).payload as *const u8,
                                    (*q).len as usize,
                                );
                                segs.push(seg.to_vec());
                                q = (*q).next;
                            }
                            (self.api.pbuf_free)(pbuf);
                        }
                        Some(segs)
                    };
                    self.events.push_back(StackEvent::Recved {
                        conn: SlotId::from_raw(arg),
                        data,
                    });
                }
                RawEvent::Sent { arg, pcb, len } => {
                    if let Some(meta) = self.meta.get_mut(&pcb) {
                        meta.snd_free = (meta.snd_free + len as usize).min(TCP_SND_BUF_BYTES);
                    }
                    self.events.push_back(StackEvent::Sent {
                        conn: SlotId::from_raw(arg),
                        len: len as usize,
                    });
                }
                RawEvent::Connected { arg } => {
                    self.events.push_back(StackEvent::Connected {
                        conn: SlotId::from_raw(arg),
                    });
                }
                RawEvent::Errored { arg, err } => {
                    self.events.push_back(StackEvent::Errored {
                        conn: SlotId::from_raw(arg),
                        err: map_err(err),
                    });
                }
                RawEvent::Poll { arg } => {
                    self.events.push_back(StackEvent::Poll {
                        conn: SlotId::from_raw(arg),
                    });
                }
                RawEvent::FrameOut { frame } => {
                    self.events.push_back(StackEvent::FrameOut { frame });
                }
            }
        }
    }
}

impl Stack for LwipStack {
    fn tcp_new(&mut self) -> Option<Pcb> {
        let pcb = unsafe { (self.api.tcp_new)() };
        self.drain_raw();
        if pcb.is_null() {
            return None;
        }
        self.meta.insert(
            pcb as usize,
            PcbMeta {
                state: PcbState::Closed,
                snd_free: TCP_SND_BUF_BYTES,
            },
        );
        Some(Pcb(pcb as usize))
    }

    fn tcp_bind(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        let mut ip = RawIp4::from(addr);
        let err = unsafe { (self.api.tcp_bind)(pcb.0 as *mut RawTcpPcb, &mut ip, port) };
        self.drain_raw();
        if err == ERR_OK {
            Ok(())
        } else {
            Err(map_err(err))
        }
    }

    fn tcp_listen(&mut self, pcb: Pcb, backlog: i32) -> Option<Pcb> {
        let backlog = backlog.clamp(1, LISTEN_BACKLOG_MAX) as u8;
        let lpcb =
            unsafe { (self.api.tcp_listen_with_backlog)(pcb.0 as *mut RawTcpPcb, backlog) };
        self.drain_raw();
        if lpcb.is_null() {
            return None;
        }
        // The library freed the original PCB and returned a smaller one.
        self.meta.remove(&pcb.0);
        self.meta.insert(
            lpcb as usize,
            PcbMeta {
                state: PcbState::Listen,
                snd_free: 0,
            },
        );
        Some(Pcb(lpcb as usize))
    }

    fn install_accept(&mut self, pcb: Pcb, handle: SlotId) {
        unsafe {
            (self.api.tcp_arg)(pcb.0 as *mut RawTcpPcb, handle.to_raw() as *mut c_void);
            (self.api.tcp_accept)(pcb.0 as *mut RawTcpPcb, Some(accept_tramp));
        }
    }

    fn tcp_accepted(&mut self, _listener: Pcb) {
        // Backlog accounting is compiled out of the bundled stack build; the
        // acknowledgement is a no-op at this ABI.
    }

    fn tcp_connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        let mut ip = RawIp4::from(addr);
        let err = unsafe {
            (self.api.tcp_connect)(pcb.0 as *mut RawTcpPcb, &mut ip, port, Some(connected_tramp))
        };
        self.drain_raw();
        if err == ERR_OK {
            if let Some(meta) = self.meta.get_mut(&pcb.0) {
                meta.state = PcbState::Active;
            }
            Ok(())
        } else {
            Err(map_err(err))
        }
    }

    fn install_callbacks(&mut self, pcb: Pcb, handle: SlotId) {
        let pcb = pcb.0 as *mut RawTcpPcb;
        unsafe {
            (self.api.tcp_arg)(pcb, handle.to_raw() as *mut c_void);
            (self.api.tcp_recv)(pcb, Some(recv_tramp));
            (self.api.tcp_sent)(pcb, Some(sent_tramp));
            (self.api.tcp_err)(pcb, Some(err_tramp));
            (self.api.tcp_poll)(pcb, Some(poll_tramp), POLL_INTERVAL_TICKS);
        }
    }

    fn detach_callbacks(&mut self, pcb: Pcb) {
        let pcb = pcb.0 as *mut RawTcpPcb;
        unsafe {
            (self.api.tcp_arg)(pcb, ptr::null_mut());
            (self.api.tcp_sent)(pcb, None);
            (self.api.tcp_recv)(pcb, None);
            (self.api.tcp_err)(pcb, None);
            (self.api.tcp_poll)(pcb, None, 0);
        }
    }

    fn tcp_write(&mut self, pcb: Pcb, data: &[u8]) -> Result<(), StackError> {
        debug_assert!(data.len() <= u16::MAX as usize);
        let err = unsafe {
            (self.api.tcp_write)(
                pcb.0 as *mut RawTcpPcb,
                data.as_ptr() as *const c_void,
                data.len() as u16,
                TCP_WRITE_FLAG_COPY,
            )
        };
        self.drain_raw();
        if err == ERR_OK {
            if let Some(meta) = self.meta.get_mut(&pcb.0) {
                meta.snd_free = meta.snd_free.saturating_sub(data.len());
            }
            Ok(())
        } else {
            Err(map_err(err))
        }
    }

    fn tcp_output(&mut self, pcb: Pcb) {
        let err = unsafe { (self.api.tcp_output)(pcb.0 as *mut RawTcpPcb) };
        self.drain_raw();
        if err != ERR_OK {
            tracing::debug!(err, "tcp_output failed");
        }
    }

    fn tcp_recved(&mut self, pcb: Pcb, len: usize) {
        unsafe { (self.api.tcp_recved)(pcb.0 as *mut RawTcpPcb, len as u16) };
        self.drain_raw();
    }

    fn tcp_close(&mut self, pcb: Pcb) -> Result<(), StackError> {
        self.meta.remove(&pcb.0);
        let err = unsafe { (self.api.tcp_close)(pcb.0 as *mut RawTcpPcb) };
        self.drain_raw();
        if err == ERR_OK {
            Ok(())
        } else {
            Err(map_err(err))
        }
    }

    fn pcb_gone(&mut self, pcb: Pcb) {
        self.meta.remove(&pcb.0);
    }

    fn snd_buf(&mut self, pcb: Pcb) -> usize {
        self.meta.get(&pcb.0).map(|m| m.snd_free).unwrap_or(0)
    }

    fn state(&mut self, pcb: Pcb) -> PcbState {
        self.meta
            .get(&pcb.0)
            .map(|m| m.state)
            .unwrap_or(PcbState::Closed)
    }

    fn tcp_tmr(&mut self) {
        unsafe { (self.api.tcp_tmr)() };
        self.drain_raw();
    }

    fn etharp_tmr(&mut self) {
        unsafe { (self.api.etharp_tmr)() };
        self.drain_raw();
    }

    fn netif_add(&mut self, cfg: NetifConfig) -> Result<(), StackError> {
        let mut ip = RawIp4::from(cfg.ip);
        let mut netmask = RawIp4::from(cfg.netmask);
        let mut gw = RawIp4::from(cfg.gateway);
        NETIF_INIT.with(|c| {
            c.set(Some(NetifInitCtx {
                output: self.api.etharp_output,
                mac: cfg.mac.octets(),
                mtu: cfg.mtu,
            }))
        });
        let added = unsafe {
            (self.api.netif_add)(
                &mut *self.netif,
                &mut ip,
                &mut netmask,
                &mut gw,
                ptr::null_mut(),
                Some(netif_init_tramp),
                Some(self.api.ethernet_input),
            )
        };
        self.drain_raw();
        if added.is_null() {
            return Err(StackError::If);
        }
        unsafe {
            (self.api.netif_set_default)(&mut *self.netif);
            (self.api.netif_set_up)(&mut *self.netif);
        }
        self.drain_raw();
        Ok(())
    }

    fn netif_input(&mut self, frame: &[u8]) -> Result<(), StackError> {
        if frame.len() > u16::MAX as usize {
            return Err(StackError::Val);
        }
        let p = unsafe { (self.api.pbuf_alloc)(PBUF_RAW, frame.len() as u16, PBUF_POOL) };
        if p.is_null() {
            return Err(StackError::Mem);
        }
        // Copy across the chain honoring per-pbuf lengths.
        unsafe {
            let mut q = p;
            let mut off = 0usize;
            while !q.is_null() && off < frame.len() {
                let n = ((*q).len as usize).min(frame.len() - off);
                ptr::copy_nonoverlapping(frame[off..].as_ptr(), (*q).payload as *mut u8, n);
                off += n;
                q = (*q).next;
            }
        }
        let Some(input) = self.netif.input else {
            unsafe { (self.api.pbuf_free)(p) };
            return Err(StackError::If);
        };
        let err = unsafe { input(p, &mut *self.netif) };
        self.drain_raw();
        if err != ERR_OK {
            unsafe { (self.api.pbuf_free)(p) };
            return Err(map_err(err));
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_code_mapping() {
        assert_eq!(map_err(ERR_MEM), StackError::Mem);
        assert_eq!(map_err(ERR_USE), StackError::Use);
        assert_eq!(map_err(ERR_RTE), StackError::Rte);
        assert_eq!(map_err(ERR_ISCONN), StackError::IsConn);
        assert_eq!(map_err(ERR_ARG), StackError::Arg);
        assert_eq!(map_err(-99), StackError::If);
    }

    #[test]
    fn test_slot_handle_survives_pointer_roundtrip() {
        let mut slots = crate::slots::Slots::new();
        let id = slots.insert(());
        let raw = id.to_raw() as *mut c_void;
        assert_eq!(SlotId::from_raw(raw as usize), id);
    }
}
