//! Replication control-plane message formats.
//!
//! Control messages ride directly on Ethernet/IPv4 inside the 172.16.0.0/16
//! subnet; there is no real L4 header. Demux is on (IP protocol, destination
//! address): probe traffic reuses the flow's own protocol number so upstream
//! ECMP hashes it like flow traffic, state messages use protocol 0.
//!
//! Byte order on the backup payload: the 5-tuple is network order, the state
//! fields are little-endian. The latter matches the wire behavior of the
//! deployed gateways, which copy host-order state on little-endian hosts.

use crate::table::{FlowKey, FlowState, KEY_BYTES};
use std::net::Ipv4Addr;
use thiserror::Error;

/// TTL on every gateway-originated control packet; keeps replication traffic
/// inside the site's L2 broadcast domain.
pub const CONTROL_TTL: u8 = 4;
/// IPv4 identification value carried by control packets.
pub const CONTROL_IP_ID: u16 = 0x36;
/// IP protocol number for state-backup and broadcast messages.
pub const PROTO_STATE: u8 = 0;

pub const BACKUP_PAYLOAD_LEN: usize = 40;
pub const PROBE_BODY_LEN: usize = 24;

const CONTROL_NET: [u8; 2] = [172, 16];
const PROBE_SUBNET: u8 = 253;
const STATE_SUBNET: u8 = 0;
const BROADCAST_HOST: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlClass {
    ProbeRequest,
    ProbeReply,
    Broadcast,
    BackupPush,
    Unknown,
}

/// Classify a control-queue frame by IP protocol and destination address.
pub fn classify_control(proto: u8, dst: Ipv4Addr) -> ControlClass {
    let octets = dst.octets();
    if octets[0] != CONTROL_NET[0] || octets[1] != CONTROL_NET[1] {
        return ControlClass::Unknown;
    }
    match proto {
        crate::wire::IPPROTO_TCP | crate::wire::IPPROTO_UDP => {
            if octets[2] == PROBE_SUBNET {
                ControlClass::ProbeRequest
            } else {
                ControlClass::ProbeReply
            }
        }
        PROTO_STATE => {
            if octets[2] == STATE_SUBNET && octets[3] == BROADCAST_HOST {
                ControlClass::Broadcast
            } else if octets[2] == STATE_SUBNET {
                ControlClass::BackupPush
            } else {
                ControlClass::Unknown
            }
        }
        _ => ControlClass::Unknown,
    }
}

/// Destination for the probe request of a flow: inside the probe /24, host
/// byte taken from the flow's client address so distinct flows spread across
/// the subnet.
pub fn probe_request_dst(key: &FlowKey) -> Ipv4Addr {
    Ipv4Addr::new(
        CONTROL_NET[0],
        CONTROL_NET[1],
        PROBE_SUBNET,
        key.src_ip().octets()[3],
    )
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("control payload truncated: need {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Encode a `(key, state)` pair into the 40-byte backup payload.
pub fn encode_backup(key: &FlowKey, state: &FlowState) -> [u8; BACKUP_PAYLOAD_LEN] {
    let mut payload = [0u8; BACKUP_PAYLOAD_LEN];
    payload[0..KEY_BYTES].copy_from_slice(&key.to_bytes());
    payload[16..20].copy_from_slice(&u32::from(state.server_ip).to_le_bytes());
    payload[20..24].copy_from_slice(&u32::from(state.dip).to_le_bytes());
    payload[24..26].copy_from_slice(&state.dport.to_le_bytes());
    payload[28..32].copy_from_slice(&u32::from(state.bip).to_le_bytes());
    payload
}

pub fn decode_backup(payload: &[u8]) -> Result<(FlowKey, FlowState), CodecError> {
    if payload.len() < BACKUP_PAYLOAD_LEN {
        return Err(CodecError::Truncated {
            expected: BACKUP_PAYLOAD_LEN,
            got: payload.len(),
        });
    }
    let mut key_bytes = [0u8; KEY_BYTES];
    key_bytes.copy_from_slice(&payload[0..KEY_BYTES]);
    let key = FlowKey::from_bytes(&key_bytes);
    let state = FlowState {
        server_ip: read_le_addr(&payload[16..20]),
        dip: read_le_addr(&payload[20..24]),
        dport: u16::from_le_bytes([payload[24], payload[25]]),
        bip: read_le_addr(&payload[28..32]),
    };
    Ok((key, state))
}

/// Body shared by probe requests and probe replies. The leading port pair
/// sits exactly where a TCP/UDP header would put it, which is what upstream
/// ECMP hardware hashes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBody {
    pub l4_src_port: u16,
    pub l4_dst_port: u16,
    /// Request: the probing gateway. Reply: the responding gateway claiming
    /// the flow.
    pub gateway: Ipv4Addr,
    pub key: FlowKey,
}

pub fn encode_probe(body: &ProbeBody) -> [u8; PROBE_BODY_LEN] {
    let mut bytes = [0u8; PROBE_BODY_LEN];
    bytes[0..2].copy_from_slice(&body.l4_src_port.to_be_bytes());
    bytes[2..4].copy_from_slice(&body.l4_dst_port.to_be_bytes());
    bytes[4..8].copy_from_slice(&body.gateway.octets());
    bytes[8..8 + KEY_BYTES].copy_from_slice(&body.key.to_bytes());
    bytes
}

pub fn decode_probe(payload: &[u8]) -> Result<ProbeBody, CodecError> {
    if payload.len() < PROBE_BODY_LEN {
        return Err(CodecError::Truncated {
            expected: PROBE_BODY_LEN,
            got: payload.len(),
        });
    }
    let mut key_bytes = [0u8; KEY_BYTES];
    key_bytes.copy_from_slice(&payload[8..8 + KEY_BYTES]);
    Ok(ProbeBody {
        l4_src_port: u16::from_be_bytes([payload[0], payload[1]]),
        l4_dst_port: u16::from_be_bytes([payload[2], payload[3]]),
        gateway: Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]),
        key: FlowKey::from_bytes(&key_bytes),
    })
}

fn read_le_addr(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
