//! Wire protocol between the netcon service and the intercept library.
//!
//! Every client → service message is one tag byte followed by a fixed-length
//! little-endian payload; the tag alone determines how many bytes to read.
//! The service answers with a `RETVAL` record (tag, i32 return value, i32
//! errno). Socket addresses travel in the C `sockaddr_in` layout so the
//! intercept library can pass them through unmodified: 2-byte family, 2-byte
//! port in network order, 4-byte address in network order, 8 bytes of zero.
//!
//! These byte values are shared with the preloaded intercept library and
//! must never change.

use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

// Tag bytes. Stable constants shared with the intercept library.
pub const RPC_SOCKET: u8 = 1;
pub const RPC_LISTEN: u8 = 2;
pub const RPC_BIND: u8 = 3;
pub const RPC_KILL_INTERCEPT: u8 = 4;
pub const RPC_CONNECT: u8 = 5;
pub const RPC_FD_MAP_COMPLETION: u8 = 6;
pub const RPC_RETVAL: u8 = 7;

/// `sockaddr_in` is 16 bytes on every platform we care about.
pub const SOCKADDR_IN_LEN: usize = 16;

/// Total length of a `RETVAL` record including the tag byte.
pub const RETVAL_LEN: usize = 1 + 4 + 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
    #[error("unknown rpc tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("short payload: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("unsupported address family: {0}")]
    BadAddressFamily(u16),
}

/// Payload length for a given tag, excluding the tag byte itself.
///
/// Returns `None` for tags this side never receives (`RETVAL`) or does not
/// know about.
pub fn payload_len(tag: u8) -> Option<usize> {
    match tag {
        RPC_SOCKET => Some(12),
        RPC_LISTEN => Some(8),
        RPC_BIND => Some(4 + SOCKADDR_IN_LEN),
        RPC_CONNECT => Some(4 + SOCKADDR_IN_LEN),
        RPC_KILL_INTERCEPT => Some(0),
        RPC_FD_MAP_COMPLETION => Some(4),
        _ => None,
    }
}

/// A decoded client → service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `socket(domain, type, protocol)`
    Socket { domain: i32, stype: i32, protocol: i32 },
    /// `bind(their_fd, addr)`
    Bind { their_fd: i32, addr: SocketAddrV4 },
    /// `listen(their_fd, backlog)`
    Listen { their_fd: i32, backlog: i32 },
    /// `connect(their_fd, addr)`
    Connect { their_fd: i32, addr: SocketAddrV4 },
    /// The descriptor number the client assigned to the most recently
    /// transferred socket.
    FdMapCompletion { perceived_fd: i32 },
    /// Reserved; accepted and ignored.
    KillIntercept,
}

impl Request {
    /// Decode a payload for `tag`. `payload` must be exactly
    /// `payload_len(tag)` bytes.
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Request, ProtoError> {
        let need = payload_len(tag).ok_or(ProtoError::UnknownTag(tag))?;
        if payload.len() < need {
            return Err(ProtoError::Truncated { need, got: payload.len() });
        }
        match tag {
            RPC_SOCKET => Ok(Request::Socket {
                domain: read_i32(payload, 0),
                stype: read_i32(payload, 4),
                protocol: read_i32(payload, 8),
            }),
            RPC_BIND => Ok(Request::Bind {
                their_fd: read_i32(payload, 0),
                addr: decode_sockaddr_in(&payload[4..4 + SOCKADDR_IN_LEN])?,
            }),
            RPC_LISTEN => Ok(Request::Listen {
                their_fd: read_i32(payload, 0),
                backlog: read_i32(payload, 4),
            }),
            RPC_CONNECT => Ok(Request::Connect {
                their_fd: read_i32(payload, 0),
                addr: decode_sockaddr_in(&payload[4..4 + SOCKADDR_IN_LEN])?,
            }),
            RPC_FD_MAP_COMPLETION => Ok(Request::FdMapCompletion {
                perceived_fd: read_i32(payload, 0),
            }),
            RPC_KILL_INTERCEPT => Ok(Request::KillIntercept),
            _ => Err(ProtoError::UnknownTag(tag)),
        }
    }

    /// Encode the request as a full record (tag byte + payload).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Socket { domain, stype, protocol } => {
                let mut out = Vec::with_capacity(13);
                out.push(RPC_SOCKET);
                out.extend_from_slice(&domain.to_le_bytes());
                out.extend_from_slice(&stype.to_le_bytes());
                out.extend_from_slice(&protocol.to_le_bytes());
                out
            }
            Request::Bind { their_fd, addr } => encode_fd_addr(RPC_BIND, *their_fd, addr),
            Request::Listen { their_fd, backlog } => {
                let mut out = Vec::with_capacity(9);
                out.push(RPC_LISTEN);
                out.extend_from_slice(&their_fd.to_le_bytes());
                out.extend_from_slice(&backlog.to_le_bytes());
                out
            }
            Request::Connect { their_fd, addr } => encode_fd_addr(RPC_CONNECT, *their_fd, addr),
            Request::FdMapCompletion { perceived_fd } => {
                let mut out = Vec::with_capacity(5);
                out.push(RPC_FD_MAP_COMPLETION);
                out.extend_from_slice(&perceived_fd.to_le_bytes());
                out
            }
            Request::KillIntercept => vec![RPC_KILL_INTERCEPT],
        }
    }
}

/// A service → client reply record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retval {
    pub retval: i32,
    pub errno: i32,
}

impl Retval {
    pub fn encode(&self) -> [u8; RETVAL_LEN] {
        let mut out = [0u8; RETVAL_LEN];
        out[0] = RPC_RETVAL;
        out[1..5].copy_from_slice(&self.retval.to_le_bytes());
        out[5..9].copy_from_slice(&self.errno.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Retval, ProtoError> {
        if buf.len() < RETVAL_LEN {
            return Err(ProtoError::Truncated { need: RETVAL_LEN, got: buf.len() });
        }
        if buf[0] != RPC_RETVAL {
            return Err(ProtoError::UnknownTag(buf[0]));
        }
        Ok(Retval {
            retval: read_i32(&buf[1..], 0),
            errno: read_i32(&buf[1..], 4),
        })
    }
}

/// Encode an address in the C `sockaddr_in` layout.
pub fn encode_sockaddr_in(addr: &SocketAddrV4) -> [u8; SOCKADDR_IN_LEN] {
    let mut out = [0u8; SOCKADDR_IN_LEN];
    out[0..2].copy_from_slice(&(libc::AF_INET as u16).to_le_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out
}

/// Decode a C `sockaddr_in`. The family field must be `AF_INET`.
pub fn decode_sockaddr_in(buf: &[u8]) -> Result<SocketAddrV4, ProtoError> {
    if buf.len() < SOCKADDR_IN_LEN {
        return Err(ProtoError::Truncated { need: SOCKADDR_IN_LEN, got: buf.len() });
    }
    let family = u16::from_le_bytes([buf[0], buf[1]]);
    if family != libc::AF_INET as u16 {
        return Err(ProtoError::BadAddressFamily(family));
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Ok(SocketAddrV4::new(ip, port))
}

fn encode_fd_addr(tag: u8, fd: i32, addr: &SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + SOCKADDR_IN_LEN);
    out.push(tag);
    out.extend_from_slice(&fd.to_le_bytes());
    out.extend_from_slice(&encode_sockaddr_in(addr));
    out
}

#[inline]
fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_roundtrip() {
        let req = Request::Socket { domain: libc::AF_INET, stype: libc::SOCK_STREAM, protocol: 0 };
        let bytes = req.encode();
        assert_eq!(bytes[0], RPC_SOCKET);
        assert_eq!(bytes.len(), 1 + payload_len(RPC_SOCKET).unwrap());
        assert_eq!(Request::decode(bytes[0], &bytes[1..]).unwrap(), req);
    }

    #[test]
    fn test_bind_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 9000);
        let req = Request::Bind { their_fd: 7, addr };
        let bytes = req.encode();
        assert_eq!(bytes.len(), 1 + payload_len(RPC_BIND).unwrap());
        assert_eq!(Request::decode(bytes[0], &bytes[1..]).unwrap(), req);
    }

    #[test]
    fn test_connect_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 1234);
        let req = Request::Connect { their_fd: 8, addr };
        let bytes = req.encode();
        assert_eq!(Request::decode(bytes[0], &bytes[1..]).unwrap(), req);
    }

    #[test]
    fn test_sockaddr_port_is_network_order() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 0x1234);
        let bytes = encode_sockaddr_in(&addr);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..], &[0u8; 8]);
    }

    #[test]
    fn test_bad_family_rejected() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80);
        let mut bytes = encode_sockaddr_in(&addr);
        bytes[0] = 0xff;
        bytes[1] = 0xff;
        assert_eq!(decode_sockaddr_in(&bytes), Err(ProtoError::BadAddressFamily(0xffff)));
    }

    #[test]
    fn test_retval_roundtrip() {
        let rv = Retval { retval: -1, errno: libc::EADDRINUSE };
        let bytes = rv.encode();
        assert_eq!(bytes[0], RPC_RETVAL);
        assert_eq!(Retval::decode(&bytes).unwrap(), rv);
    }

    #[test]
    fn test_truncated_payload() {
        let err = Request::decode(RPC_BIND, &[0u8; 10]).unwrap_err();
        assert_eq!(err, ProtoError::Truncated { need: 20, got: 10 });
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(payload_len(0xaa), None);
        assert_eq!(Request::decode(0xaa, &[]), Err(ProtoError::UnknownTag(0xaa)));
    }

    #[test]
    fn test_kill_intercept_is_empty() {
        assert_eq!(Request::KillIntercept.encode(), vec![RPC_KILL_INTERCEPT]);
        assert_eq!(payload_len(RPC_KILL_INTERCEPT), Some(0));
    }
}
