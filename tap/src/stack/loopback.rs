//! In-process stack implementation.
//!
//! Implements the [`Stack`] contract with a minimal TCP-like transport so the
//! whole service — frame adapter, fabric hand-off, callback glue, data pump —
//! can be exercised without the production stack library. Segments really
//! travel as Ethernet frames through [`StackEvent::FrameOut`] and come back
//! through [`Stack::netif_input`], so a fabric that loops frames around
//! carries the handshake, data and acks end to end.
//!
//! Flow control is a fixed per-PCB send budget: `tcp_write` consumes it and
//! an ack frame returns it (and fires the `sent` callback), which is what the
//! service's backpressure gate keys on.

use super::{NetifConfig, Pcb, PcbState, Stack, StackError, StackEvent};
use crate::eth::{build_eth_header, parse_frame, Mac, ETH_HDR_LEN};
use crate::slots::SlotId;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Local experimental ethertype carrying loopback segments.
pub const LOOPBACK_ETHERTYPE: u16 = 0x88b5;

const SEG_HDR_LEN: usize = 13;

const KIND_SYN: u8 = 1;
const KIND_SYN_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_DATA_ACK: u8 = 4;
const KIND_FIN: u8 = 5;
const KIND_RST: u8 = 6;

const DEFAULT_SND_BUF: usize = 32 * 1024;
const FIRST_EPHEMERAL: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Listen,
    SynSent,
    Established,
}

struct Entry {
    state: State,
    local_port: Option<u16>,
    remote: Option<(Ipv4Addr, u16)>,
    arg: Option<SlotId>,
    accept_arg: Option<SlotId>,
    callbacks: bool,
    snd_free: usize,
    /// Bytes accepted by `tcp_write` before the handshake finished.
    unsent: Vec<u8>,
}

pub struct LoopbackStack {
    pcbs: HashMap<usize, Entry>,
    next_id: usize,
    events: VecDeque<StackEvent>,
    cfg: Option<NetifConfig>,
    snd_cap: usize,
    next_ephemeral: u16,
    tcp_ticks: Arc<AtomicU64>,
    arp_ticks: Arc<AtomicU64>,
}

impl LoopbackStack {
    pub fn new() -> LoopbackStack {
        LoopbackStack::with_send_buffer(DEFAULT_SND_BUF)
    }

    /// A stack whose per-PCB send budget is `cap` bytes. Small budgets make
    /// the service's backpressure gate trip quickly.
    pub fn with_send_buffer(cap: usize) -> LoopbackStack {
        LoopbackStack {
            pcbs: HashMap::new(),
            next_id: 1,
            events: VecDeque::new(),
            cfg: None,
            snd_cap: cap.max(1),
            next_ephemeral: FIRST_EPHEMERAL,
            tcp_ticks: Arc::new(AtomicU64::new(0)),
            arp_ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counters incremented by each timer pulse, observable after the stack
    /// has been moved into the service.
    pub fn timer_counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (self.tcp_ticks.clone(), self.arp_ticks.clone())
    }

    fn alloc(&mut self, entry: Entry) -> Pcb {
        let id = self.next_id;
        self.next_id += 1;
        self.pcbs.insert(id, entry);
        Pcb(id)
    }

    fn port_in_use(&self, port: u16, except: usize) -> bool {
        self.pcbs
            .iter()
            .any(|(&id, e)| id != except && e.local_port == Some(port))
    }

    fn mss(&self) -> usize {
        let mtu = self.cfg.map(|c| c.mtu as usize).unwrap_or(1500);
        mtu.saturating_sub(ETH_HDR_LEN + SEG_HDR_LEN).max(1)
    }

    fn emit(
        &mut self,
        kind: u8,
        src_port: u16,
        dst_port: u16,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) {
        let Some(cfg) = self.cfg else { return };
        let mut frame = Vec::with_capacity(ETH_HDR_LEN + SEG_HDR_LEN + payload.len());
        frame.extend_from_slice(&build_eth_header(Mac::BROADCAST, cfg.mac, LOOPBACK_ETHERTYPE));
        frame.push(kind);
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&src_ip.octets());
        frame.extend_from_slice(&dst_ip.octets());
        frame.extend_from_slice(payload);
        self.events.push_back(StackEvent::FrameOut { frame });
    }

    fn emit_data(
        &mut self,
        src_port: u16,
        dst_port: u16,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        data: &[u8],
    ) {
        let mss = self.mss();
        for chunk in data.chunks(mss) {
            self.emit(KIND_DATA, src_port, dst_port, src_ip, dst_ip, chunk);
        }
    }

    fn find(&self, pred: impl Fn(&Entry) -> bool) -> Option<usize> {
        self.pcbs
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(&id, _)| id)
            .min()
    }

    fn handle_segment(&mut self, seg: &[u8]) {
        let kind = seg[0];
        let src_port = u16::from_be_bytes([seg[1], seg[2]]);
        let dst_port = u16::from_be_bytes([seg[3], seg[4]]);
        let src_ip = Ipv4Addr::new(seg[5], seg[6], seg[7], seg[8]);
        let dst_ip = Ipv4Addr::new(seg[9], seg[10], seg[11], seg[12]);
        let payload = &seg[SEG_HDR_LEN..];
        let our_ip = self.cfg.map(|c| c.ip);

        match kind {
            KIND_SYN => {
                if Some(dst_ip) != our_ip {
                    // Routed nowhere; fail the originating active open.
                    let origin = self.find(|e| {
                        e.state == State::SynSent && e.local_port == Some(src_port)
                    });
                    if let Some(id) = origin {
                        let entry = self.pcbs.remove(&id).unwrap();
                        if let (true, Some(arg)) = (entry.callbacks, entry.arg) {
                            self.events
                                .push_back(StackEvent::Errored { conn: arg, err: StackError::Rte });
                        }
                    }
                    return;
                }
                let listener = self.find(|e| {
                    e.state == State::Listen && e.local_port == Some(dst_port)
                });
                match listener.and_then(|id| self.pcbs[&id].accept_arg) {
                    Some(accept_arg) => {
                        let new_pcb = self.alloc(Entry {
                            state: State::Established,
                            local_port: Some(dst_port),
                            remote: Some((src_ip, src_port)),
                            arg: None,
                            accept_arg: None,
                            callbacks: false,
                            snd_free: self.snd_cap,
                            unsent: Vec::new(),
                        });
                        self.events.push_back(StackEvent::Accepted {
                            listener: accept_arg,
                            new_pcb,
                        });
                        self.emit(KIND_SYN_ACK, dst_port, src_port, dst_ip, src_ip, &[]);
                    }
                    None => {
                        self.emit(KIND_RST, dst_port, src_port, dst_ip, src_ip, &[]);
                    }
                }
            }
            KIND_SYN_ACK => {
                let id = self.find(|e| {
                    e.state == State::SynSent
                        && e.local_port == Some(dst_port)
                        && e.remote == Some((src_ip, src_port))
                });
                let Some(id) = id else { return };
                let entry = self.pcbs.get_mut(&id).unwrap();
                entry.state = State::Established;
                let queued = std::mem::take(&mut entry.unsent);
                let (callbacks, arg) = (entry.callbacks, entry.arg);
                if !queued.is_empty() {
                    self.emit_data(dst_port, src_port, dst_ip, src_ip, &queued);
                }
                if callbacks {
                    if let Some(arg) = arg {
                        self.events.push_back(StackEvent::Connected { conn: arg });
                    }
                }
            }
            KIND_DATA => {
                let id = self.find(|e| {
                    e.state == State::Established
                        && e.local_port == Some(dst_port)
                        && e.remote == Some((src_ip, src_port))
                });
                let Some(id) = id else { return };
                let entry = &self.pcbs[&id];
                if entry.callbacks {
                    if let Some(arg) = entry.arg {
                        self.events.push_back(StackEvent::Recved {
                            conn: arg,
                            data: Some(vec![payload.to_vec()]),
                        });
                    }
                }
                let len = (payload.len() as u32).to_le_bytes();
                self.emit(KIND_DATA_ACK, dst_port, src_port, dst_ip, src_ip, &len);
            }
            KIND_DATA_ACK => {
                if payload.len() < 4 {
                    return;
                }
                let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]])
                    as usize;
                let id = self.find(|e| {
                    e.state == State::Established
                        && e.local_port == Some(dst_port)
                        && e.remote == Some((src_ip, src_port))
                });
                let Some(id) = id else { return };
                let cap = self.snd_cap;
                let entry = self.pcbs.get_mut(&id).unwrap();
                entry.snd_free = (entry.snd_free + len).min(cap);
                if entry.callbacks {
                    if let Some(arg) = entry.arg {
                        self.events.push_back(StackEvent::Sent { conn: arg, len });
                    }
                }
            }
            KIND_FIN => {
                let id = self.find(|e| {
                    e.state == State::Established
                        && e.local_port == Some(dst_port)
                        && e.remote == Some((src_ip, src_port))
                });
                let Some(id) = id else { return };
                let entry = &self.pcbs[&id];
                if entry.callbacks {
                    if let Some(arg) = entry.arg {
                        self.events
                            .push_back(StackEvent::Recved { conn: arg, data: None });
                    }
                }
            }
            KIND_RST => {
                let id = self.find(|e| {
                    (e.state == State::SynSent || e.state == State::Established)
                        && e.local_port == Some(dst_port)
                        && e.remote == Some((src_ip, src_port))
                });
                let Some(id) = id else { return };
                let entry = self.pcbs.remove(&id).unwrap();
                if let (true, Some(arg)) = (entry.callbacks, entry.arg) {
                    self.events
                        .push_back(StackEvent::Errored { conn: arg, err: StackError::Rst });
                }
            }
            _ => {}
        }
    }
}

impl Default for LoopbackStack {
    fn default() -> Self {
        LoopbackStack::new()
    }
}

impl Stack for LoopbackStack {
    fn tcp_new(&mut self) -> Option<Pcb> {
        let cap = self.snd_cap;
        Some(self.alloc(Entry {
            state: State::Closed,
            local_port: None,
            remote: None,
            arg: None,
            accept_arg: None,
            callbacks: false,
            snd_free: cap,
            unsent: Vec::new(),
        }))
    }

    fn tcp_bind(&mut self, pcb: Pcb, _addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        if self.port_in_use(port, pcb.0) {
            return Err(StackError::Use);
        }
        let entry = self.pcbs.get_mut(&pcb.0).ok_or(StackError::Arg)?;
        if entry.state != State::Closed {
            return Err(StackError::Val);
        }
        entry.local_port = Some(port);
        Ok(())
    }

    fn tcp_listen(&mut self, pcb: Pcb, _backlog: i32) -> Option<Pcb> {
        let entry = self.pcbs.remove(&pcb.0)?;
        Some(self.alloc(Entry {
            state: State::Listen,
            local_port: entry.local_port,
            remote: None,
            arg: None,
            accept_arg: None,
            callbacks: false,
            snd_free: 0,
            unsent: Vec::new(),
        }))
    }

    fn install_accept(&mut self, pcb: Pcb, handle: SlotId) {
        if let Some(entry) = self.pcbs.get_mut(&pcb.0) {
            entry.accept_arg = Some(handle);
        }
    }

    fn tcp_accepted(&mut self, _listener: Pcb) {}

    fn tcp_connect(&mut self, pcb: Pcb, addr: Ipv4Addr, port: u16) -> Result<(), StackError> {
        let Some(cfg) = self.cfg else {
            return Err(StackError::Rte);
        };
        if !self.pcbs.contains_key(&pcb.0) {
            return Err(StackError::Arg);
        }
        let local_port = match self.pcbs[&pcb.0].local_port {
            Some(p) => p,
            None => {
                let mut p = self.next_ephemeral;
                while self.port_in_use(p, pcb.0) {
                    p = p.checked_add(1).unwrap_or(FIRST_EPHEMERAL);
                }
                self.next_ephemeral = p.checked_add(1).unwrap_or(FIRST_EPHEMERAL);
                p
            }
        };
        let entry = self.pcbs.get_mut(&pcb.0).unwrap();
        entry.local_port = Some(local_port);
        entry.state = State::SynSent;
        entry.remote = Some((addr, port));
        self.emit(KIND_SYN, local_port, port, cfg.ip, addr, &[]);
        Ok(())
    }

    fn install_callbacks(&mut self, pcb: Pcb, handle: SlotId) {
        if let Some(entry) = self.pcbs.get_mut(&pcb.0) {
            entry.arg = Some(handle);
            entry.callbacks = true;
        }
    }

    fn detach_callbacks(&mut self, pcb: Pcb) {
        if let Some(entry) = self.pcbs.get_mut(&pcb.0) {
            entry.arg = None;
            entry.accept_arg = None;
            entry.callbacks = false;
        }
    }

    fn tcp_write(&mut self, pcb: Pcb, data: &[u8]) -> Result<(), StackError> {
        let our_ip = self.cfg.map(|c| c.ip);
        let entry = self.pcbs.get_mut(&pcb.0).ok_or(StackError::Arg)?;
        match entry.state {
            State::SynSent | State::Established => {}
            _ => return Err(StackError::Conn),
        }
        if data.len() > entry.snd_free {
            return Err(StackError::Mem);
        }
        entry.snd_free -= data.len();
        if entry.state == State::SynSent {
            entry.unsent.extend_from_slice(data);
            return Ok(());
        }
        let (Some(local_port), Some((rip, rport)), Some(our_ip)) =
            (entry.local_port, entry.remote, our_ip)
        else {
            return Err(StackError::Conn);
        };
        let data = data.to_vec();
        self.emit_data(local_port, rport, our_ip, rip, &data);
        Ok(())
    }

    fn tcp_output(&mut self, _pcb: Pcb) {}

    fn tcp_recved(&mut self, _pcb: Pcb, _len: usize) {}

    fn tcp_close(&mut self, pcb: Pcb) -> Result<(), StackError> {
        let entry = self.pcbs.remove(&pcb.0).ok_or(StackError::Arg)?;
        if entry.state == State::Established {
            if let (Some(local_port), Some((rip, rport)), Some(cfg)) =
                (entry.local_port, entry.remote, self.cfg)
            {
                self.emit(KIND_FIN, local_port, rport, cfg.ip, rip, &[]);
            }
        }
        Ok(())
    }

    fn snd_buf(&mut self, pcb: Pcb) -> usize {
        self.pcbs.get(&pcb.0).map(|e| e.snd_free).unwrap_or(0)
    }

    fn state(&mut self, pcb: Pcb) -> PcbState {
        match self.pcbs.get(&pcb.0).map(|e| e.state) {
            Some(State::Closed) => PcbState::Closed,
            Some(State::Listen) => PcbState::Listen,
            Some(_) => PcbState::Active,
            None => PcbState::Closed,
        }
    }

    fn tcp_tmr(&mut self) {
        self.tcp_ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn etharp_tmr(&mut self) {
        self.arp_ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn netif_add(&mut self, cfg: NetifConfig) -> Result<(), StackError> {
        self.cfg = Some(cfg);
        Ok(())
    }

    fn netif_input(&mut self, frame: &[u8]) -> Result<(), StackError> {
        let Some((_dst, _src, ethertype, payload)) = parse_frame(frame) else {
            return Err(StackError::Val);
        };
        if ethertype != LOOPBACK_ETHERTYPE || payload.len() < SEG_HDR_LEN {
            return Ok(());
        }
        let seg = payload.to_vec();
        self.handle_segment(&seg);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }
}
