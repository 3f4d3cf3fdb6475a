//! The manager slave: drains the NF→manager ring and emits ECMP probes.

use super::packet_builder;
use crate::ctx::{bump, GatewayCtx};
use crate::logger::{self, BreadcrumbFlags};
use crate::port::{PortDriver, BURST_SIZE, QUEUE_DATA};
use crate::wire::replication::probe_request_dst;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ManagerSlave<D: PortDriver> {
    ctx: Arc<GatewayCtx>,
    driver: Arc<D>,
    ports: Vec<u16>,
}

impl<D: PortDriver> ManagerSlave<D> {
    pub fn new(ctx: Arc<GatewayCtx>, driver: Arc<D>) -> Self {
        let ports = ctx.enabled_ports.clone();
        Self { ctx, driver, ports }
    }

    pub fn run(&self, running: &AtomicBool) {
        logger::info("manager slave draining backup requests");
        while running.load(Ordering::Relaxed) {
            self.poll();
        }
    }

    /// Drain up to a burst of freshly installed flows, sending one probe per
    /// flow on every enabled port. Fire-and-forget: a lost probe leaves the
    /// flow installed locally and unreplicated until a later cycle.
    pub fn poll(&self) -> usize {
        let mut probed = 0;
        while probed < BURST_SIZE {
            let Some(key) = self.ctx.dequeue_backup() else {
                break;
            };
            let dst_mac = self.ctx.interface_mac();
            for &port in &self.ports {
                let frame = packet_builder::probe_request(
                    self.driver.mac(port),
                    dst_mac,
                    self.ctx.self_ip,
                    &key,
                );
                let sent = self.driver.tx_burst(port, QUEUE_DATA, vec![frame]);
                if sent < 1 {
                    bump(&self.ctx.counters.tx_incomplete);
                }
            }
            bump(&self.ctx.counters.probes_sent);
            logger::breadcrumb(
                BreadcrumbFlags::PROBE,
                format!("probing {} via {}", key, probe_request_dst(&key)),
            );
            probed += 1;
        }
        probed
    }
}
