//! Frame builders shared by the unit tests. These construct the frames a
//! client, a switch, or a peer gateway would put on the wire.

use crate::wire::checksum;
use crate::wire::{ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHER_HDR_LEN, IPV4_HDR_LEN};
use std::net::Ipv4Addr;

pub const CLIENT_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x99];
pub const GATEWAY_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, ttl: u8, l4: &[u8]) -> Vec<u8> {
    let total_len = IPV4_HDR_LEN + l4.len();
    let mut frame = vec![0u8; ETHER_HDR_LEN + total_len];
    frame[0..6].copy_from_slice(&GATEWAY_MAC);
    frame[6..12].copy_from_slice(&CLIENT_MAC);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip = &mut frame[ETHER_HDR_LEN..];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = ttl;
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    ip[IPV4_HDR_LEN..].copy_from_slice(l4);
    let cksum = checksum::ipv4_header(&ip[..IPV4_HDR_LEN]);
    ip[10..12].copy_from_slice(&cksum.to_be_bytes());
    frame
}

pub fn tcp_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: u8,
) -> Vec<u8> {
    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    ipv4_frame(src, dst, 6, 64, &tcp)
}

pub fn udp_frame(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut udp = [0u8; 8];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&8u16.to_be_bytes());
    ipv4_frame(src, dst, 17, 64, &udp)
}

/// A control frame as a peer gateway would emit it (TTL 4, raw body after
/// the IPv4 header).
pub fn control_frame(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, body: &[u8]) -> Vec<u8> {
    ipv4_frame(src, dst, proto, 4, body)
}

pub fn arp_request_frame(
    sender_mac: [u8; 6],
    sender_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHER_HDR_LEN + 28];
    frame[0..6].copy_from_slice(&[0xFF; 6]);
    frame[6..12].copy_from_slice(&sender_mac);
    frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());

    let arp = &mut frame[ETHER_HDR_LEN..];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes());
    arp[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&1u16.to_be_bytes());
    arp[8..14].copy_from_slice(&sender_mac);
    arp[14..18].copy_from_slice(&sender_ip.octets());
    arp[24..28].copy_from_slice(&target_ip.octets());
    frame
}
