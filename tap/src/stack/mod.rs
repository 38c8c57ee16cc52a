//! Facade over the embedded userspace TCP/IP stack.
//!
//! The stack is a black box behind the [`Stack`] trait: the service drives it
//! through the operations below and the stack answers through
//! [`StackEvent`]s. Implementations queue events while an entry point runs;
//! the caller drains them, in order, before releasing the stack's lock
//! domain. That keeps callbacks on the calling thread, in callback order,
//! without re-entering the stack.
//!
//! Two implementations ship: [`lwip::LwipStack`] binds the dynamically
//! loaded production stack, and [`loopback::LoopbackStack`] is an in-process
//! stack used by the test suite and for wiring experiments.

pub mod loopback;
pub mod lwip;

use crate::slots::SlotId;
use std::net::Ipv4Addr;
use std::time::Duration;

/// TCP timer pulse period.
pub const TCP_TIMER_INTERVAL: Duration = Duration::from_millis(10);

/// ARP timer pulse period (the stack's own constant).
pub const ARP_TIMER_INTERVAL: Duration = Duration::from_millis(5_000);

/// Opaque protocol control block handle. Never null for the lifetime of a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pcb(pub(crate) usize);

/// The subset of PCB states the service branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbState {
    Closed,
    Listen,
    Active,
}

/// Stack error codes, mirrored from the embedded stack's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    Mem,
    Buf,
    Timeout,
    Rte,
    InProgress,
    Val,
    WouldBlock,
    Use,
    IsConn,
    Abrt,
    Rst,
    Clsd,
    Conn,
    Arg,
    If,
}

impl StackError {
    /// Translate to the POSIX errno the intercept library reports to its
    /// caller. Codes with no errno correlate collapse to a generic sentinel.
    pub fn errno(self) -> i32 {
        match self {
            StackError::Mem => libc::ENOMEM,
            StackError::Buf => libc::ENOBUFS,
            StackError::Timeout | StackError::Abrt => libc::ETIMEDOUT,
            StackError::Rte => libc::ENETUNREACH,
            StackError::InProgress => libc::EINPROGRESS,
            StackError::Val => libc::EINVAL,
            StackError::WouldBlock => libc::EWOULDBLOCK,
            StackError::Use => libc::EADDRINUSE,
            StackError::IsConn => libc::EISCONN,
            StackError::Rst
            | StackError::Clsd
            | StackError::Conn
            | StackError::Arg
            | StackError::If => -1,
        }
    }
}

/// Configuration for the tap network interface registered with the stack.
#[derive(Debug, Clone, Copy)]
pub struct NetifConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub mac: crate::eth::Mac,
    pub mtu: u16,
}

/// A callback the stack delivered, resolved to the slot handle that was
/// installed as the PCB's opaque argument.
#[derive(Debug)]
pub enum StackEvent {
    /// A listening PCB accepted an inbound connection.
    Accepted { listener: SlotId, new_pcb: Pcb },
    /// Bytes arrived for a connection. `None` means the remote closed.
    Recved {
        conn: SlotId,
        data: Option<Vec<Vec<u8>>>,
    },
    /// The remote acked `len` bytes; send-buffer space opened up.
    Sent { conn: SlotId, len: usize },
    /// An asynchronous connect completed.
    Connected { conn: SlotId },
    /// Fatal per-PCB error. The PCB is already gone from the stack's
    /// perspective when this is delivered.
    Errored { conn: SlotId, err: StackError },
    /// Idle poll tick.
    Poll { conn: SlotId },
    /// The stack emitted a frame for the wire.
    FrameOut { frame: Vec<u8> },
}

/// Driver surface of the embedded TCP/IP stack.
///
/// Callers must hold the single service lock across every call and drain
/// [`Stack::poll_event`] before releasing it.
pub trait Stack: Send {
    fn tcp_new(&mut self) -> Option<Pcb>;

    fn tcp_bind(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError>;

    /// Move `pcb` into the listening state. Returns the (possibly new,
    /// smaller) listening PCB that replaces it.
    fn tcp_listen(&mut self, pcb: Pcb, backlog: i32) -> Option<Pcb>;

    /// Install the accept callback handle on a listening PCB.
    fn install_accept(&mut self, pcb: Pcb, handle: SlotId);

    /// Tell the stack it may queue further inbound connections on a
    /// listener whose accept callback just completed.
    fn tcp_accepted(&mut self, listener: Pcb);

    /// Start an active open. Completion is reported via
    /// [`StackEvent::Connected`] or [`StackEvent::Errored`].
    fn tcp_connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError>;

    /// Install the data-path callbacks (`recv`, `sent`, `err`, `poll`) with
    /// `handle` as the PCB's opaque argument.
    fn install_callbacks(&mut self, pcb: Pcb, handle: SlotId);

    /// Null out every callback so nothing fires for this PCB again.
    fn detach_callbacks(&mut self, pcb: Pcb);

    /// Enqueue bytes into the PCB's send buffer. Fails with
    /// [`StackError::Mem`] when the buffer cannot take `data`.
    fn tcp_write(&mut self, pcb: Pcb, data: &[u8]) -> Result<(), StackError>;

    /// Push queued send data onto the wire.
    fn tcp_output(&mut self, pcb: Pcb);

    /// Advance the receive window after delivering `len` bytes to the
    /// application side.
    fn tcp_recved(&mut self, pcb: Pcb, len: usize);

    fn tcp_close(&mut self, pcb: Pcb) -> Result<(), StackError>;

    /// Forget a PCB that the stack already freed on its own (delivered with
    /// [`StackEvent::Errored`]). Must not touch the PCB itself.
    fn pcb_gone(&mut self, _pcb: Pcb) {}

    /// Free bytes in the PCB's send buffer.
    fn snd_buf(&mut self, pcb: Pcb) -> usize;

    fn state(&mut self, pcb: Pcb) -> PcbState;

    fn tcp_tmr(&mut self);

    fn etharp_tmr(&mut self);

    /// Register the tap interface.
    fn netif_add(&mut self, cfg: NetifConfig) -> Result<(), StackError>;

    /// Feed one inbound Ethernet frame (header included) to the stack.
    fn netif_input(&mut self, frame: &[u8]) -> Result<(), StackError>;

    /// Next queued callback event, in delivery order.
    fn poll_event(&mut self) -> Option<StackEvent>;
}
