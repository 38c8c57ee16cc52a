//! End-to-end scenarios: a client process over the control rendezvous, the
//! in-process stack, and a fabric that loops frames back into the tap.

use netcon_proto::{Request, Retval, RETVAL_LEN};
use netcon_tap::eth::Mac;
use netcon_tap::fdpass;
use netcon_tap::stack::loopback::LoopbackStack;
use netcon_tap::{FrameHandler, Tap};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TAP_IP: Ipv4Addr = Ipv4Addr::new(10, 7, 0, 2);
const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Frame queue standing in for the overlay: outbound frames pile up here
/// until a test loops them back in.
#[derive(Clone, Default)]
struct Fabric {
    frames: Arc<Mutex<VecDeque<(Mac, Mac, u16, Vec<u8>)>>>,
}

impl Fabric {
    fn handler(&self) -> FrameHandler {
        let sink = self.frames.clone();
        Box::new(move |_nwid, src, dst, ethertype, _vlan, data| {
            sink.lock()
                .unwrap()
                .push_back((src, dst, ethertype, data.to_vec()));
        })
    }

    fn pump(&self, tap: &Tap) -> usize {
        let batch: Vec<_> = self.frames.lock().unwrap().drain(..).collect();
        let n = batch.len();
        for (src, dst, ethertype, data) in batch {
            tap.put(src, dst, ethertype, &data);
        }
        n
    }

    fn wait_for_frames(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !self.frames.lock().unwrap().is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("no frames reached the fabric");
    }
}

fn start_tap(nwid: u64, stack: LoopbackStack) -> (Tap, Fabric) {
    let fabric = Fabric::default();
    let tap = Tap::with_stack(
        nwid,
        Mac([0x02, 0, 0, 0, 0, 0x42]),
        1500,
        Box::new(stack),
        fabric.handler(),
    )
    .unwrap();
    assert!(tap.add_ip(TAP_IP, NETMASK));
    (tap, fabric)
}

/// Unique network id per test so rendezvous paths never collide.
fn nwid(tag: u64) -> u64 {
    ((std::process::id() as u64) << 16) | tag
}

/// Keep pumping the fabric until `done` reports success or time runs out.
fn drive<F: FnMut() -> bool>(fabric: &Fabric, tap: &Tap, mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        fabric.pump(tap);
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// What the intercept library does, by hand.
struct Client {
    ctl: UnixStream,
}

impl Client {
    fn connect(tap: &Tap) -> Client {
        let ctl = UnixStream::connect(tap.socket_path()).unwrap();
        ctl.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Client { ctl }
    }

    fn send(&mut self, req: &Request) {
        self.ctl.write_all(&req.encode()).unwrap();
    }

    /// SOCKET, collect the transferred descriptor, complete the mapping.
    fn socket(&mut self, fd_num: i32) -> UnixStream {
        self.send(&Request::Socket {
            domain: libc::AF_INET,
            stype: libc::SOCK_STREAM,
            protocol: 0,
        });
        let fd = fdpass::recv_fd(self.ctl.as_raw_fd()).unwrap();
        self.send(&Request::FdMapCompletion {
            perceived_fd: fd_num,
        });
        let stream = UnixStream::from(fd);
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn retval(&mut self) -> Retval {
        let mut buf = [0u8; RETVAL_LEN];
        self.ctl.read_exact(&mut buf).unwrap();
        Retval::decode(&buf).unwrap()
    }

    fn assert_silent(&mut self) {
        self.ctl.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 1];
        let res = self.ctl.read(&mut buf);
        assert!(
            matches!(&res, Err(e) if e.kind() == ErrorKind::WouldBlock),
            "unexpected control traffic: {res:?}"
        );
        self.ctl.set_nonblocking(false).unwrap();
    }
}

fn bind_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)
}

/// Listener on 9000 plus a connected pair: returns
/// `(listening client, connecting client, listener endpoint, A, B)` where
/// bytes written to A come out of B.
fn establish(tap: &Tap, fabric: &Fabric) -> (Client, Client, UnixStream, UnixStream, UnixStream) {
    let mut c1 = Client::connect(tap);
    let listen_data = c1.socket(7);
    c1.send(&Request::Bind {
        their_fd: 7,
        addr: bind_addr(9000),
    });
    assert_eq!(c1.retval(), Retval { retval: 0, errno: 0 });
    c1.send(&Request::Listen {
        their_fd: 7,
        backlog: 8,
    });
    assert_eq!(c1.retval(), Retval { retval: 0, errno: 0 });

    let mut c2 = Client::connect(tap);
    let a_data = c2.socket(8);
    c2.send(&Request::Connect {
        their_fd: 8,
        addr: SocketAddrV4::new(TAP_IP, 9000),
    });

    // The accept side announces itself with one byte on the listening
    // endpoint, then transfers the new descriptor on the control channel.
    listen_data.set_nonblocking(true).unwrap();
    let mut sentinel = [0u8; 1];
    assert!(
        drive(fabric, tap, || (&listen_data)
            .read(&mut sentinel)
            .map(|n| n == 1)
            .unwrap_or(false)),
        "no accept sentinel"
    );
    listen_data.set_nonblocking(false).unwrap();

    let b_data = UnixStream::from(fdpass::recv_fd(c1.ctl.as_raw_fd()).unwrap());
    b_data
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    c1.send(&Request::FdMapCompletion { perceived_fd: 9 });

    for _ in 0..5 {
        fabric.pump(tap);
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(c2.retval(), Retval { retval: 0, errno: 0 });

    (c1, c2, listen_data, a_data, b_data)
}

#[test]
fn s1_socket_bind_listen() {
    let (tap, _fabric) = start_tap(nwid(1), LoopbackStack::new());
    let mut c = Client::connect(&tap);
    let _data = c.socket(7);

    c.send(&Request::Bind {
        their_fd: 7,
        addr: bind_addr(9000),
    });
    assert_eq!(c.retval(), Retval { retval: 0, errno: 0 });

    c.send(&Request::Listen {
        their_fd: 7,
        backlog: 128,
    });
    assert_eq!(c.retval(), Retval { retval: 0, errno: 0 });
    c.assert_silent();
}

#[test]
fn s2_bind_port_in_use() {
    let (tap, _fabric) = start_tap(nwid(2), LoopbackStack::new());
    let mut c = Client::connect(&tap);

    let _a = c.socket(7);
    c.send(&Request::Bind {
        their_fd: 7,
        addr: bind_addr(9000),
    });
    assert_eq!(c.retval(), Retval { retval: 0, errno: 0 });

    let _b = c.socket(8);
    c.send(&Request::Bind {
        their_fd: 8,
        addr: bind_addr(9000),
    });
    let rv = c.retval();
    assert_eq!((rv.retval, rv.errno), (-1, libc::EADDRINUSE));
}

#[test]
fn s3_connect_unreachable_replies_exactly_once() {
    let (tap, fabric) = start_tap(nwid(3), LoopbackStack::new());
    let mut c = Client::connect(&tap);
    let _data = c.socket(8);

    c.send(&Request::Connect {
        their_fd: 8,
        addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 1234),
    });

    // The open is in flight; nothing may be on the wire to the client yet.
    fabric.wait_for_frames();
    c.assert_silent();

    fabric.pump(&tap);
    let rv = c.retval();
    assert_eq!((rv.retval, rv.errno), (-1, libc::ENETUNREACH));

    std::thread::sleep(Duration::from_millis(30));
    fabric.pump(&tap);
    c.assert_silent();
}

#[test]
fn s4_data_roundtrip() {
    let (tap, fabric) = start_tap(nwid(4), LoopbackStack::new());
    let (_c1, _c2, _listen_data, a_data, b_data) = establish(&tap, &fabric);

    (&a_data).write_all(b"hello").unwrap();

    b_data.set_nonblocking(true).unwrap();
    let mut got = Vec::new();
    assert!(
        drive(&fabric, &tap, || {
            let mut buf = [0u8; 64];
            if let Ok(n) = (&b_data).read(&mut buf) {
                got.extend_from_slice(&buf[..n]);
            }
            got.len() >= 5
        }),
        "bytes never arrived"
    );
    assert_eq!(got, b"hello");

    // And nothing else follows.
    fabric.pump(&tap);
    std::thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 16];
    let res = (&b_data).read(&mut buf);
    assert!(matches!(&res, Err(e) if e.kind() == ErrorKind::WouldBlock));
}

/// A writer outpacing the fabric stalls once the kernel buffers and the
/// stack's send budget fill; draining the fabric releases everything, in
/// order, to the peer.
#[test]
fn s5_backpressure() {
    let (tap, fabric) = start_tap(nwid(5), LoopbackStack::with_send_buffer(4096));
    let (_c1, _c2, _listen_data, a_data, b_data) = establish(&tap, &fabric);

    a_data.set_nonblocking(true).unwrap();
    let chunk = [0xa5u8; 8192];
    let mut written = 0usize;
    let mut stalled = false;
    while written < 512 * 1024 {
        match (&a_data).write(&chunk) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                stalled = true;
                break;
            }
            Err(e) => panic!("write failed: {e}"),
        }
    }
    assert!(stalled, "writer never saw backpressure");

    b_data.set_nonblocking(true).unwrap();
    let mut got = 0usize;
    assert!(
        drive(&fabric, &tap, || {
            let mut buf = [0u8; 16384];
            while let Ok(n) = (&b_data).read(&mut buf) {
                if n == 0 {
                    break;
                }
                got += n;
            }
            got >= written
        }),
        "drained {got} of {written} bytes"
    );
    assert_eq!(got, written);
}

#[test]
fn s6_clean_teardown() {
    let (tap, _fabric) = start_tap(nwid(6), LoopbackStack::new());
    let mut c = Client::connect(&tap);
    let a_data = c.socket(7);
    let b_data = c.socket(8);
    let path = tap.socket_path().to_path_buf();

    let start = Instant::now();
    drop(tap);
    assert!(start.elapsed() < Duration::from_secs(1), "teardown dragged");
    assert!(!path.exists(), "rendezvous not removed");

    // Service-side descriptors are closed: both endpoints and the control
    // channel read end-of-stream.
    let mut buf = [0u8; 1];
    a_data
        .set_read_timeout(Some(Duration::from_secs(1)))
        .unwrap();
    b_data
        .set_read_timeout(Some(Duration::from_secs(1)))
        .unwrap();
    assert_eq!((&a_data).read(&mut buf).unwrap(), 0);
    assert_eq!((&b_data).read(&mut buf).unwrap(), 0);
    assert_eq!(c.ctl.read(&mut buf).unwrap(), 0);
}

#[test]
fn reactor_ticks_the_tcp_timer() {
    let stack = LoopbackStack::new();
    let (tcp_ticks, arp_ticks) = stack.timer_counters();
    let (tap, _fabric) = start_tap(nwid(7), stack);

    std::thread::sleep(Duration::from_millis(200));
    let ticks = tcp_ticks.load(Ordering::Relaxed);
    assert!(ticks >= 5, "tcp timer ticked only {ticks} times in 200ms");
    // The ARP period is seconds; it must not have raced ahead.
    assert!(arp_ticks.load(Ordering::Relaxed) <= 1);
    drop(tap);
}

#[test]
fn client_disconnect_leaves_tap_healthy() {
    let (tap, _fabric) = start_tap(nwid(8), LoopbackStack::new());
    {
        let mut c = Client::connect(&tap);
        let _data = c.socket(7);
        // Client process dies here.
    }
    std::thread::sleep(Duration::from_millis(50));

    // New clients still get service.
    let mut c2 = Client::connect(&tap);
    let _data = c2.socket(7);
    c2.send(&Request::Bind {
        their_fd: 7,
        addr: bind_addr(9100),
    });
    assert_eq!(c2.retval(), Retval { retval: 0, errno: 0 });
}
