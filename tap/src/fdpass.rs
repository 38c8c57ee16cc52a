//! Descriptor transfer over local stream sockets.
//!
//! Data endpoints are created as socket pairs; the peer half is handed to the
//! client process over its control channel as ancillary data (`SCM_RIGHTS`).
//! One descriptor travels per message, carried on a single dummy byte so the
//! receiver has something to block on.

use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Create a connected stream socket pair.
pub fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(io::Error::from)
}

/// Transfer `fd` over the stream socket `sock`.
pub fn send_fd(sock: RawFd, fd: RawFd) -> io::Result<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(sock, &iov, &cmsg, MsgFlags::empty(), None).map_err(io::Error::from)?;
    Ok(())
}

/// Receive one descriptor from the stream socket `sock`.
///
/// Blocks until the carrier byte arrives (subject to the socket's receive
/// timeout). Fails if the message carries no descriptor.
pub fn recv_fd(sock: RawFd) -> io::Result<OwnedFd> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg = cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(io::Error::from)?;
    for c in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = c {
            if let Some(&fd) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no descriptor in control message",
    ))
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_fd_transfer_over_socketpair() {
        let (carrier_a, carrier_b) = socketpair_stream().unwrap();

        // The payload pair: write into one half, transfer the other.
        let (payload_ours, payload_theirs) = socketpair_stream().unwrap();

        send_fd(carrier_a.as_raw_fd(), payload_theirs.as_raw_fd()).unwrap();
        let received = recv_fd(carrier_b.as_raw_fd()).unwrap();

        let mut ours = UnixStream::from(payload_ours);
        let mut theirs = UnixStream::from(received);
        ours.write_all(b"over the wall").unwrap();

        let mut buf = [0u8; 13];
        theirs.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"over the wall");
    }

    #[test]
    fn test_recv_without_fd_fails() {
        let (a, b) = socketpair_stream().unwrap();
        let mut a = UnixStream::from(a);
        a.write_all(&[0u8]).unwrap();
        let err = recv_fd(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_set_nonblocking() {
        let (a, _b) = socketpair_stream().unwrap();
        set_nonblocking(a.as_raw_fd()).unwrap();
        let mut a = UnixStream::from(a);
        let mut buf = [0u8; 1];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
