//! Raw Ethernet frame classification and in-place header edits.
//!
//! Everything here works on plain byte slices with explicit bounds checks;
//! frames that fail a check surface as `FrameError` so the workers can count
//! and drop them.

pub mod checksum;
pub mod replication;

use crate::table::FlowKey;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const ETHER_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const TCP_FLAG_SYN: u8 = 0x02;

const ARP_FRAME_LEN: usize = ETHER_HDR_LEN + 28;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad IPv4 IHL {0}")]
    BadIhl(u8),
    #[error("IPv4 total length {total} exceeds frame payload {available}")]
    BadTotalLength { total: usize, available: usize },
}

/// What the NF worker decided about a received frame. Field values are copied
/// out so the frame itself stays free for in-place edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    ArpRequest { sender_mac: [u8; 6] },
    Tcp { key: FlowKey, flags: u8 },
    Udp { key: FlowKey },
    /// Recognized but outside the data path: non-request ARP, IPv4 protocols
    /// other than TCP/UDP, foreign EtherTypes.
    Unhandled,
}

/// IPv4 header summary used by the control path.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Meta {
    pub header_len: usize,
    pub total_len: usize,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

pub fn classify(frame: &[u8]) -> Result<Classified, FrameError> {
    if frame.len() < ETHER_HDR_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    match ether_type(frame) {
        ETHERTYPE_ARP => classify_arp(frame),
        ETHERTYPE_IPV4 => classify_ipv4(frame),
        _ => Ok(Classified::Unhandled),
    }
}

fn classify_arp(frame: &[u8]) -> Result<Classified, FrameError> {
    if frame.len() < ARP_FRAME_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let arp = &frame[ETHER_HDR_LEN..];
    let hardware = u16::from_be_bytes([arp[0], arp[1]]);
    let protocol = u16::from_be_bytes([arp[2], arp[3]]);
    let opcode = u16::from_be_bytes([arp[6], arp[7]]);
    if hardware != 1 || protocol != ETHERTYPE_IPV4 || arp[4] != 6 || arp[5] != 4 {
        return Ok(Classified::Unhandled);
    }
    if opcode != ARP_OP_REQUEST {
        return Ok(Classified::Unhandled);
    }
    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&arp[8..14]);
    Ok(Classified::ArpRequest { sender_mac })
}

fn classify_ipv4(frame: &[u8]) -> Result<Classified, FrameError> {
    let meta = ipv4_meta(frame)?;
    let l4 = &frame[ETHER_HDR_LEN + meta.header_len..ETHER_HDR_LEN + meta.total_len];
    match meta.proto {
        IPPROTO_TCP => {
            if l4.len() < 20 {
                return Err(FrameError::Truncated(frame.len()));
            }
            let key = FlowKey::new(
                meta.src,
                meta.dst,
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
                IPPROTO_TCP,
            );
            Ok(Classified::Tcp { key, flags: l4[13] })
        }
        IPPROTO_UDP => {
            if l4.len() < 8 {
                return Err(FrameError::Truncated(frame.len()));
            }
            let key = FlowKey::new(
                meta.src,
                meta.dst,
                u16::from_be_bytes([l4[0], l4[1]]),
                u16::from_be_bytes([l4[2], l4[3]]),
                IPPROTO_UDP,
            );
            Ok(Classified::Udp { key })
        }
        _ => Ok(Classified::Unhandled),
    }
}

/// Parse and bounds-check the IPv4 header of an Ethernet frame.
pub fn ipv4_meta(frame: &[u8]) -> Result<Ipv4Meta, FrameError> {
    if frame.len() < ETHER_HDR_LEN + IPV4_HDR_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let ip = &frame[ETHER_HDR_LEN..];
    let ihl = ip[0] & 0x0F;
    let header_len = usize::from(ihl) * 4;
    if (ip[0] >> 4) != 4 || header_len < IPV4_HDR_LEN {
        return Err(FrameError::BadIhl(ihl));
    }
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    // Short frames are rejected; trailing bytes beyond total_length are
    // tolerated (minimum-size Ethernet padding).
    if total_len < header_len || total_len > ip.len() {
        return Err(FrameError::BadTotalLength {
            total: total_len,
            available: ip.len(),
        });
    }
    Ok(Ipv4Meta {
        header_len,
        total_len,
        proto: ip[9],
        src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
        dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
    })
}

/// The L4-and-beyond bytes of a parsed IPv4 frame.
pub fn ipv4_payload<'a>(frame: &'a [u8], meta: &Ipv4Meta) -> &'a [u8] {
    &frame[ETHER_HDR_LEN + meta.header_len..ETHER_HDR_LEN + meta.total_len]
}

pub fn ether_type(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

pub fn mac_string(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Rewrite an ARP request into the matching reply, in place. Returns the
/// requester's MAC so the caller can record the upstream switch address.
pub fn arp_reply_in_place(frame: &mut [u8], port_mac: [u8; 6]) -> Result<[u8; 6], FrameError> {
    if frame.len() < ARP_FRAME_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let mut requester = [0u8; 6];
    requester.copy_from_slice(&frame[6..12]);

    // Ethernet: back to the requester, from this port.
    frame[0..6].copy_from_slice(&requester);
    frame[6..12].copy_from_slice(&port_mac);

    let arp = &mut frame[ETHER_HDR_LEN..];
    arp[6..8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());
    // Target hardware <- original sender hardware, sender hardware <- ours.
    let mut sender_hw = [0u8; 6];
    sender_hw.copy_from_slice(&arp[8..14]);
    arp[18..24].copy_from_slice(&sender_hw);
    arp[8..14].copy_from_slice(&port_mac);
    // Swap sender/target protocol addresses.
    let mut sender_ip = [0u8; 4];
    sender_ip.copy_from_slice(&arp[14..18]);
    let mut target_ip = [0u8; 4];
    target_ip.copy_from_slice(&arp[24..28]);
    arp[14..18].copy_from_slice(&target_ip);
    arp[24..28].copy_from_slice(&sender_ip);

    Ok(requester)
}

/// Rewrite the IPv4 destination address and refresh the header checksum.
pub fn rewrite_ipv4_dst(frame: &mut [u8], new_dst: Ipv4Addr) -> Result<(), FrameError> {
    let meta = ipv4_meta(frame)?;
    let ip = &mut frame[ETHER_HDR_LEN..ETHER_HDR_LEN + meta.header_len];
    ip[16..20].copy_from_slice(&new_dst.octets());
    ip[10..12].copy_from_slice(&[0, 0]);
    let cksum = checksum::ipv4_header(ip);
    ip[10..12].copy_from_slice(&cksum.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{arp_request_frame, tcp_frame, udp_frame};

    #[test]
    fn classifies_tcp_syn_with_canonical_key() {
        let frame = tcp_frame(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 17, 17, 2),
            40001,
            80,
            TCP_FLAG_SYN,
        );
        match classify(&frame).unwrap() {
            Classified::Tcp { key, flags } => {
                assert_eq!(flags, TCP_FLAG_SYN);
                assert_eq!(key.src_ip(), Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(key.dst_ip(), Ipv4Addr::new(172, 17, 17, 2));
                assert_eq!(key.src_port(), 40001);
                assert_eq!(key.dst_port(), 80);
                assert_eq!(key.proto(), IPPROTO_TCP);
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn classifies_udp_ports() {
        let frame = udp_frame(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(172, 17, 17, 2),
            5353,
            53,
        );
        match classify(&frame).unwrap() {
            Classified::Udp { key } => {
                assert_eq!(key.src_port(), 5353);
                assert_eq!(key.dst_port(), 53);
                assert_eq!(key.proto(), IPPROTO_UDP);
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_and_bad_ihl_frames() {
        assert_eq!(classify(&[0u8; 8]), Err(FrameError::Truncated(8)));

        let mut frame = tcp_frame(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 17, 17, 2),
            40001,
            80,
            TCP_FLAG_SYN,
        );
        frame[ETHER_HDR_LEN] = 0x42; // IHL 2
        assert_eq!(classify(&frame), Err(FrameError::BadIhl(2)));
    }

    #[test]
    fn rejects_total_length_beyond_frame() {
        let mut frame = udp_frame(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(172, 17, 17, 2),
            5353,
            53,
        );
        frame[ETHER_HDR_LEN + 2..ETHER_HDR_LEN + 4].copy_from_slice(&4096u16.to_be_bytes());
        assert!(matches!(
            classify(&frame),
            Err(FrameError::BadTotalLength { .. })
        ));
    }

    #[test]
    fn unknown_ether_type_is_unhandled() {
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&0x86DDu16.to_be_bytes());
        assert_eq!(classify(&frame), Ok(Classified::Unhandled));
    }

    #[test]
    fn arp_request_becomes_reply_in_place() {
        let requester = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let port_mac = [0x02, 0, 0, 0, 0, 0x01];
        let mut frame = arp_request_frame(
            requester,
            Ipv4Addr::new(172, 16, 0, 254),
            Ipv4Addr::new(172, 16, 0, 1),
        );
        let learned = arp_reply_in_place(&mut frame, port_mac).unwrap();
        assert_eq!(learned, requester);

        assert_eq!(&frame[0..6], &requester);
        assert_eq!(&frame[6..12], &port_mac);
        let arp = &frame[ETHER_HDR_LEN..];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), 2);
        assert_eq!(&arp[8..14], &port_mac);
        assert_eq!(&arp[18..24], &requester);
        assert_eq!(&arp[14..18], &Ipv4Addr::new(172, 16, 0, 1).octets());
        assert_eq!(&arp[24..28], &Ipv4Addr::new(172, 16, 0, 254).octets());
    }

    #[test]
    fn dst_rewrite_updates_address_and_checksum() {
        let mut frame = tcp_frame(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 17, 17, 2),
            40001,
            80,
            TCP_FLAG_SYN,
        );
        rewrite_ipv4_dst(&mut frame, Ipv4Addr::new(10, 1, 0, 1)).unwrap();
        let meta = ipv4_meta(&frame).unwrap();
        assert_eq!(meta.dst, Ipv4Addr::new(10, 1, 0, 1));
        let header = &frame[ETHER_HDR_LEN..ETHER_HDR_LEN + meta.header_len];
        assert!(checksum::verify(header));
    }
}
