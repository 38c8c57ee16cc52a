//! Ethernet frame utilities for the overlay tap.

use std::fmt;

pub const ETH_HDR_LEN: usize = 14;

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Build an ethernet header.
pub fn build_eth_header(dst: Mac, src: Mac, ethertype: u16) -> [u8; ETH_HDR_LEN] {
    let mut hdr = [0u8; ETH_HDR_LEN];
    hdr[0..6].copy_from_slice(&dst.0);
    hdr[6..12].copy_from_slice(&src.0);
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());
    hdr
}

/// Split a frame into `(dst, src, ethertype, payload)`.
pub fn parse_frame(frame: &[u8]) -> Option<(Mac, Mac, u16, &[u8])> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Some((Mac(dst), Mac(src), ethertype, &frame[ETH_HDR_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let dst = Mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        let src = Mac([0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
        let mut frame = build_eth_header(dst, src, 0x0800).to_vec();
        frame.extend_from_slice(b"payload");

        let (d, s, et, payload) = parse_frame(&frame).unwrap();
        assert_eq!(d, dst);
        assert_eq!(s, src);
        assert_eq!(et, 0x0800);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(parse_frame(&[0u8; 13]).is_none());
        assert!(parse_frame(&[]).is_none());
    }

    #[test]
    fn test_mac_display() {
        let mac = Mac([0x02, 0xab, 0x00, 0x01, 0x02, 0xff]);
        assert_eq!(mac.to_string(), "02:ab:00:01:02:ff");
    }
}
