//! The network-function worker: per-port data-plane pipeline.
//!
//! Polls the data queue of every enabled port round-robin. ARP requests are
//! answered in place, TCP SYNs install flow state and pin the flow to a
//! backend, everything else with state is rewritten toward its backend.


use crate::ctx::{bump, GatewayCtx};
use crate::logger::{self, BreadcrumbFlags};
use crate::port::{PortDriver, BURST_SIZE, QUEUE_DATA};
use crate::table::{FlowKey, FlowState, InsertError};
use crate::wire::{self, Classified, TCP_FLAG_SYN};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct NfWorker<D: PortDriver> {
    ctx: Arc<GatewayCtx>,
    driver: Arc<D>,
    ports: Vec<u16>,
    /// Monotone per-worker sequence driving backend rotation; advances once
    /// per SYN seen.
    counter: u64,
}

impl<D: PortDriver> NfWorker<D> {
    pub fn new(ctx: Arc<GatewayCtx>, driver: Arc<D>) -> Self {
        let ports = ctx.enabled_ports.clone();
        Self {
            ctx,
            driver,
            ports,
            counter: 0,
        }
    }

    pub fn run(&mut self, running: &AtomicBool) {
        logger::info(format!("nf worker polling {} port(s)", self.ports.len()));
        while running.load(Ordering::Relaxed) {
            self.poll();
        }
    }

    /// One pass over every enabled port. Returns the number of frames seen.
    pub fn poll(&mut self) -> usize {
        let mut seen = 0;
        for index in 0..self.ports.len() {
            let port = self.ports[index];
            let frames = self.driver.rx_burst(port, QUEUE_DATA, BURST_SIZE);
            seen += frames.len();
            for frame in frames {
                self.handle_frame(port, frame);
            }
        }
        seen
    }

    fn handle_frame(&mut self, port: u16, frame: Vec<u8>) {
        bump(&self.ctx.counters.rx_data);
        match wire::classify(&frame) {
            Ok(Classified::ArpRequest { .. }) => self.handle_arp(port, frame),
            Ok(Classified::Tcp { key, flags }) => {
                if flags == TCP_FLAG_SYN {
                    self.handle_syn(port, frame, key);
                } else {
                    self.forward_established(port, frame, key);
                }
            }
            Ok(Classified::Udp { key }) => {
                // Classification only; UDP has no state path.
                bump(&self.ctx.counters.udp_classified);
                logger::breadcrumb(BreadcrumbFlags::FLOW, format!("udp {key} observed, dropped"));
            }
            Ok(Classified::Unhandled) => {
                bump(&self.ctx.counters.dropped_malformed);
            }
            Err(err) => {
                bump(&self.ctx.counters.dropped_malformed);
                logger::debug(format!("data frame on port {port} dropped: {err}"));
            }
        }
    }

    fn handle_arp(&self, port: u16, mut frame: Vec<u8>) {
        let port_mac = self.driver.mac(port);
        match wire::arp_reply_in_place(&mut frame, port_mac) {
            Ok(requester) => {
                // The requester is the upstream switch; control frames are
                // addressed to it from here on.
                self.ctx.record_interface_mac(requester);
                bump(&self.ctx.counters.arp_replies);
                logger::breadcrumb(
                    BreadcrumbFlags::ARP,
                    format!(
                        "answered arp on port {port}, learned {}",
                        wire::mac_string(&requester)
                    ),
                );
                self.transmit(port, frame);
            }
            Err(err) => {
                bump(&self.ctx.counters.dropped_malformed);
                logger::debug(format!("arp frame on port {port} dropped: {err}"));
            }
        }
    }

    fn handle_syn(&mut self, port: u16, frame: Vec<u8>, key: FlowKey) {
        let backend = self.ctx.backends.select(self.counter);
        self.counter += 1;
        match self.ctx.table.insert(key, FlowState::for_backend(backend)) {
            Ok(()) => {
                bump(&self.ctx.counters.syn_installs);
                // Ring enqueue strictly after the insert: the manager must
                // never probe for a flow the table cannot answer for.
                if !self.ctx.enqueue_backup(key) {
                    bump(&self.ctx.counters.ring_drops);
                    logger::warn(format!("backup ring full, {key} stays unreplicated"));
                }
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("installed {key} -> {backend}"),
                );
                self.rewrite_and_transmit(port, frame, backend);
            }
            Err(InsertError::Duplicate) => {
                // Retransmitted SYN, or a SYN reusing a finished tuple; the
                // first install wins and the packet follows it.
                bump(&self.ctx.counters.duplicate_syn);
                match self.ctx.table.lookup(&key) {
                    Some(state) => self.rewrite_and_transmit(port, frame, state.server_ip),
                    None => bump(&self.ctx.counters.dropped_no_state),
                }
            }
            Err(InsertError::Full) => {
                bump(&self.ctx.counters.insert_full);
                logger::warn(format!("flow table full, dropping syn for {key}"));
            }
        }
    }

    fn forward_established(&self, port: u16, frame: Vec<u8>, key: FlowKey) {
        match self.ctx.table.lookup(&key) {
            Some(state) => self.rewrite_and_transmit(port, frame, state.server_ip),
            None => {
                // Repaired by a SYN retransmit or by a backup push from the
                // peer that owns the flow.
                bump(&self.ctx.counters.dropped_no_state);
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("no state for {key}, waiting"),
                );
            }
        }
    }

    fn rewrite_and_transmit(&self, port: u16, mut frame: Vec<u8>, backend: Ipv4Addr) {
        if wire::rewrite_ipv4_dst(&mut frame, backend).is_err() {
            bump(&self.ctx.counters.dropped_malformed);
            return;
        }
        bump(&self.ctx.counters.forwarded);
        self.transmit(port, frame);
    }

    fn transmit(&self, port: u16, frame: Vec<u8>) {
        let sent = self.driver.tx_burst(port, QUEUE_DATA, vec![frame]);
        if sent < 1 {
            bump(&self.ctx.counters.tx_incomplete);
        }
    }
}
