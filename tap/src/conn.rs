//! Registry entries: control channels and TCP connections.

use crate::slots::{SlotId, Slots};
use crate::stack::Pcb;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

/// One connected client process on the control rendezvous.
pub(crate) struct Client {
    pub stream: UnixStream,
    /// Partially received RPC bytes; records are parsed out as they
    /// complete.
    pub rxbuf: Vec<u8>,
    /// Connections whose transferred descriptor still awaits the client's
    /// `FD_MAP_COMPLETION`, in transfer order.
    pub pending_maps: VecDeque<SlotId>,
}

impl Client {
    pub fn new(stream: UnixStream) -> Client {
        Client {
            stream,
            rxbuf: Vec::new(),
            pending_maps: VecDeque::new(),
        }
    }
}

/// One TCP connection: a stack PCB tied to the socket-pair endpoint shared
/// with the client that owns it.
pub(crate) struct Conn {
    pub pcb: Pcb,
    /// Service-side half of the socket pair.
    pub data: UnixStream,
    /// Owning control channel. Weak: the channel may be gone.
    pub client: SlotId,
    /// The peer half's descriptor, retained until the client confirms the
    /// mapping.
    pub their_fd: Option<OwnedFd>,
    /// Descriptor number the client assigned for this connection; unset
    /// until its `FD_MAP_COMPLETION` arrives.
    pub perceived_fd: Option<i32>,
    /// The client is awaiting exactly one return value.
    pub pending: bool,
    /// Bytes read from the data endpoint that the stack has not yet
    /// accepted.
    pub staged: Vec<u8>,
    /// Inbound bytes the data endpoint could not take; drained on
    /// writability before the receive window advances.
    pub rx_pending: Vec<u8>,
    /// Whether the reactor watches the data endpoint for readability.
    pub notify_readable: bool,
    /// Set when the stack has already freed the PCB (error callback); the
    /// stack must not be entered with it again.
    pub pcb_dead: bool,
}

impl Conn {
    pub fn new(pcb: Pcb, data: UnixStream, client: SlotId) -> Conn {
        Conn {
            pcb,
            data,
            client,
            their_fd: None,
            perceived_fd: None,
            pending: true,
            staged: Vec::new(),
            rx_pending: Vec::new(),
            notify_readable: true,
            pcb_dead: false,
        }
    }
}

/// Resolve an RPC's descriptor argument to a connection. Connections whose
/// descriptor mapping has not completed are invisible here.
pub(crate) fn by_perceived(conns: &Slots<Conn>, client: SlotId, fd: i32) -> Option<SlotId> {
    conns
        .iter()
        .find(|(_, c)| c.client == client && c.perceived_fd == Some(fd))
        .map(|(id, _)| id)
}
