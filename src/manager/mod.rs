//! The manager master: control-queue demux and state replication.
//!
//! Control traffic is demultiplexed on (IP protocol, destination address)
//! inside the 172.16.0.0/16 subnet: probe requests arrive on the probe /24,
//! probe replies on the gateway's own address, state pushes and the reserved
//! broadcast on protocol 0.

pub mod packet_builder;
pub mod slave;

use crate::ctx::{bump, GatewayCtx};
use crate::logger::{self, BreadcrumbFlags};
use crate::port::{PortDriver, BURST_SIZE, QUEUE_CONTROL, QUEUE_DATA};
use crate::table::{FlowKey, FlowState};
use crate::wire::replication::{classify_control, decode_backup, decode_probe, ControlClass, ProbeBody};
use crate::wire::{self, ETHERTYPE_IPV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ManagerMaster<D: PortDriver> {
    ctx: Arc<GatewayCtx>,
    driver: Arc<D>,
    ports: Vec<u16>,
}

impl<D: PortDriver> ManagerMaster<D> {
    pub fn new(ctx: Arc<GatewayCtx>, driver: Arc<D>) -> Self {
        let ports = ctx.enabled_ports.clone();
        Self { ctx, driver, ports }
    }

    pub fn run(&self, running: &AtomicBool) {
        logger::info(format!("manager master polling {} port(s)", self.ports.len()));
        while running.load(Ordering::Relaxed) {
            self.poll();
        }
    }

    /// One pass over every enabled control queue. Returns frames seen.
    pub fn poll(&self) -> usize {
        let mut seen = 0;
        for &port in &self.ports {
            let frames = self.driver.rx_burst(port, QUEUE_CONTROL, BURST_SIZE);
            seen += frames.len();
            for frame in frames {
                self.handle_control(port, &frame);
            }
        }
        seen
    }

    fn handle_control(&self, port: u16, frame: &[u8]) {
        bump(&self.ctx.counters.rx_control);
        if frame.len() < wire::ETHER_HDR_LEN || wire::ether_type(frame) != ETHERTYPE_IPV4 {
            bump(&self.ctx.counters.dropped_malformed);
            return;
        }
        let meta = match wire::ipv4_meta(frame) {
            Ok(meta) => meta,
            Err(err) => {
                bump(&self.ctx.counters.dropped_malformed);
                logger::debug(format!("control frame on port {port} dropped: {err}"));
                return;
            }
        };
        let payload = wire::ipv4_payload(frame, &meta);
        match classify_control(meta.proto, meta.dst) {
            ControlClass::ProbeRequest => match decode_probe(payload) {
                Ok(body) => self.answer_probe(port, &body),
                Err(err) => self.drop_malformed(port, "probe request", err),
            },
            ControlClass::ProbeReply => match decode_probe(payload) {
                Ok(body) => self.push_backup(port, &body),
                Err(err) => self.drop_malformed(port, "probe reply", err),
            },
            ControlClass::Broadcast => {
                // Reserved; observed but never acted on.
                bump(&self.ctx.counters.broadcasts_seen);
                logger::info("flow broadcast observed");
            }
            ControlClass::BackupPush => match decode_backup(payload) {
                Ok((key, state)) => self.apply_backup(key, state),
                Err(err) => self.drop_malformed(port, "backup push", err),
            },
            ControlClass::Unknown => {
                bump(&self.ctx.counters.dropped_malformed);
                logger::debug(format!(
                    "unclassified control frame on port {port}: proto {} dst {}",
                    meta.proto, meta.dst
                ));
            }
        }
    }

    /// A peer is asking who owns a flow; claim it. The reply goes back to the
    /// prober with this gateway's identity in the gateway field.
    fn answer_probe(&self, port: u16, request: &ProbeBody) {
        bump(&self.ctx.counters.probe_requests);
        let reply = packet_builder::probe_reply(
            self.driver.mac(port),
            self.ctx.interface_mac(),
            self.ctx.self_ip,
            request,
        );
        logger::breadcrumb(
            BreadcrumbFlags::PROBE,
            format!("claiming {} for {}", request.key, request.gateway),
        );
        self.transmit(port, reply);
    }

    /// A peer answered our probe: it now sits on the flow's ECMP path. Push
    /// the flow's state to it.
    fn push_backup(&self, port: u16, reply: &ProbeBody) {
        bump(&self.ctx.counters.probe_replies);
        let Some(state) = self.ctx.table.lookup(&reply.key) else {
            bump(&self.ctx.counters.dropped_no_state);
            logger::warn(format!("probe reply for unknown flow {}", reply.key));
            return;
        };
        let frame = packet_builder::backup_push(
            self.driver.mac(port),
            self.ctx.interface_mac(),
            self.ctx.self_ip,
            reply.gateway,
            &reply.key,
            &state,
        );
        bump(&self.ctx.counters.backups_sent);
        logger::breadcrumb(
            BreadcrumbFlags::BACKUP,
            format!("pushing {} -> {} to {}", reply.key, state.server_ip, reply.gateway),
        );
        self.transmit(port, frame);
    }

    /// The only path installing entries the local NF did not originate.
    /// Overwrites are idempotent by construction.
    fn apply_backup(&self, key: FlowKey, state: FlowState) {
        match self.ctx.table.upsert(key, state) {
            Ok(()) => {
                bump(&self.ctx.counters.backups_applied);
                logger::breadcrumb(
                    BreadcrumbFlags::BACKUP,
                    format!("applied backup {key} -> {}", state.server_ip),
                );
            }
            Err(err) => {
                bump(&self.ctx.counters.insert_full);
                logger::warn(format!("backup for {key} not applied: {err}"));
            }
        }
    }

    fn drop_malformed(&self, port: u16, kind: &str, err: crate::wire::replication::CodecError) {
        bump(&self.ctx.counters.dropped_malformed);
        logger::debug(format!("{kind} on port {port} dropped: {err}"));
    }

    fn transmit(&self, port: u16, frame: Vec<u8>) {
        let sent = self.driver.tx_burst(port, QUEUE_DATA, vec![frame]);
        if sent < 1 {
            bump(&self.ctx.counters.tx_incomplete);
        }
    }
}
