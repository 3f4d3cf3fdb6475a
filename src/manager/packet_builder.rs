//! Control-frame construction for probes, probe replies, and state backups.

use crate::table::{FlowKey, FlowState};
use crate::wire::checksum;
use crate::wire::replication::{
    encode_backup, encode_probe, probe_request_dst, ProbeBody, CONTROL_IP_ID, CONTROL_TTL,
    PROTO_STATE,
};
use crate::wire::{ETHER_HDR_LEN, ETHERTYPE_IPV4, IPV4_HDR_LEN};
use std::net::Ipv4Addr;

/// Probe request for a freshly installed flow. Addresses are deliberately
/// reversed relative to the flow (source = the flow's destination, L4 ports
/// swapped) so upstream ECMP hashes the probe into the same bucket as the
/// flow's return traffic.
pub fn probe_request(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    self_ip: Ipv4Addr,
    key: &FlowKey,
) -> Vec<u8> {
    let body = encode_probe(&ProbeBody {
        l4_src_port: key.dst_port(),
        l4_dst_port: key.src_port(),
        gateway: self_ip,
        key: *key,
    });
    control_frame(
        src_mac,
        dst_mac,
        key.dst_ip(),
        probe_request_dst(key),
        key.proto(),
        &body,
    )
}

/// Turn a received probe request into the reply claiming the flow: addressed
/// back to the prober, gateway field replaced with this gateway's identity,
/// ports and 5-tuple echoed.
pub fn probe_reply(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    self_ip: Ipv4Addr,
    request: &ProbeBody,
) -> Vec<u8> {
    let body = encode_probe(&ProbeBody {
        gateway: self_ip,
        ..*request
    });
    control_frame(
        src_mac,
        dst_mac,
        self_ip,
        request.gateway,
        request.key.proto(),
        &body,
    )
}

/// State-backup push carrying `(key, state)` to the gateway that claimed the
/// flow.
pub fn backup_push(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    self_ip: Ipv4Addr,
    backup_ip: Ipv4Addr,
    key: &FlowKey,
    state: &FlowState,
) -> Vec<u8> {
    control_frame(
        src_mac,
        dst_mac,
        self_ip,
        backup_ip,
        PROTO_STATE,
        &encode_backup(key, state),
    )
}

fn control_frame(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    proto: u8,
    body: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HDR_LEN + body.len();
    let mut frame = vec![0u8; ETHER_HDR_LEN + total_len];

    frame[0..6].copy_from_slice(&dst_mac);
    frame[6..12].copy_from_slice(&src_mac);
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip = &mut frame[ETHER_HDR_LEN..];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[4..6].copy_from_slice(&CONTROL_IP_ID.to_be_bytes());
    ip[8] = CONTROL_TTL;
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src_ip.octets());
    ip[16..20].copy_from_slice(&dst_ip.octets());
    ip[IPV4_HDR_LEN..].copy_from_slice(body);

    // Checksum over the finished header, last.
    let cksum = checksum::ipv4_header(&ip[..IPV4_HDR_LEN]);
    ip[10..12].copy_from_slice(&cksum.to_be_bytes());

    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::replication::{
        classify_control, decode_backup, decode_probe, ControlClass, BACKUP_PAYLOAD_LEN,
    };
    use crate::wire::{ipv4_meta, ipv4_payload};

    const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 1];
    const SWITCH_MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    fn sample_key() -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(172, 17, 17, 2),
            40001,
            80,
            6,
        )
    }

    #[test]
    fn probe_request_rides_the_reversed_flow_path() {
        let key = sample_key();
        let frame = probe_request(SRC_MAC, SWITCH_MAC, Ipv4Addr::new(172, 16, 0, 1), &key);

        assert_eq!(&frame[0..6], &SWITCH_MAC);
        assert_eq!(&frame[6..12], &SRC_MAC);

        let meta = ipv4_meta(&frame).unwrap();
        assert_eq!(meta.src, key.dst_ip());
        assert_eq!(meta.dst, Ipv4Addr::new(172, 16, 253, 5));
        assert_eq!(meta.proto, 6);
        assert_eq!(classify_control(meta.proto, meta.dst), ControlClass::ProbeRequest);

        let body = decode_probe(ipv4_payload(&frame, &meta)).unwrap();
        assert_eq!(body.l4_src_port, 80);
        assert_eq!(body.l4_dst_port, 40001);
        assert_eq!(body.gateway, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(body.key, key);
    }

    #[test]
    fn probe_reply_claims_the_flow_for_this_gateway() {
        let key = sample_key();
        let request = ProbeBody {
            l4_src_port: 80,
            l4_dst_port: 40001,
            gateway: Ipv4Addr::new(172, 16, 0, 1),
            key,
        };
        let self_ip = Ipv4Addr::new(172, 16, 0, 2);
        let frame = probe_reply(SRC_MAC, SWITCH_MAC, self_ip, &request);

        let meta = ipv4_meta(&frame).unwrap();
        assert_eq!(meta.src, self_ip);
        assert_eq!(meta.dst, request.gateway);
        assert_eq!(classify_control(meta.proto, meta.dst), ControlClass::ProbeReply);

        let body = decode_probe(ipv4_payload(&frame, &meta)).unwrap();
        assert_eq!(body.gateway, self_ip);
        assert_eq!(body.key, key);
        assert_eq!((body.l4_src_port, body.l4_dst_port), (80, 40001));
    }

    #[test]
    fn backup_push_carries_state_with_valid_header() {
        let key = sample_key();
        let state = FlowState {
            server_ip: Ipv4Addr::new(10, 1, 0, 2),
            dip: Ipv4Addr::new(172, 16, 0, 9),
            dport: 8080,
            bip: Ipv4Addr::new(172, 16, 0, 3),
        };
        let frame = backup_push(
            SRC_MAC,
            SWITCH_MAC,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 3),
            &key,
            &state,
        );

        let meta = ipv4_meta(&frame).unwrap();
        assert_eq!(meta.proto, PROTO_STATE);
        assert_eq!(meta.total_len, IPV4_HDR_LEN + BACKUP_PAYLOAD_LEN);
        assert_eq!(meta.dst, Ipv4Addr::new(172, 16, 0, 3));
        assert_eq!(classify_control(meta.proto, meta.dst), ControlClass::BackupPush);

        let ip = &frame[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_HDR_LEN];
        assert_eq!(ip[8], CONTROL_TTL);
        assert!(checksum::verify(ip));

        let decoded = decode_backup(ipv4_payload(&frame, &meta)).unwrap();
        assert_eq!(decoded, (key, state));
    }
}
