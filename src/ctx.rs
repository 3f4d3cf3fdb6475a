//! State shared by the three workers.

use crate::config::{BackendPool, GatewayConfig};
use crate::table::{FlowKey, FlowTable};
use crossbeam_channel::{Receiver, Sender};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Everything the workers share: the flow table, the backup-request ring, the
/// learned upstream MAC, the gateway identity, and the event counters.
pub struct GatewayCtx {
    pub table: FlowTable,
    pub backends: BackendPool,
    pub self_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub enabled_ports: Vec<u16>,
    pub counters: Counters,
    backup_tx: Sender<FlowKey>,
    backup_rx: Receiver<FlowKey>,
    // Upstream switch MAC in the low 48 bits. Learned from ARP; coarse
    // staleness is fine because the next ARP refreshes it.
    interface_mac: AtomicU64,
}

impl GatewayCtx {
    pub fn new(config: &GatewayConfig, port_count: u16) -> Self {
        let (backup_tx, backup_rx) = crossbeam_channel::bounded(config.ring_capacity);
        Self {
            table: FlowTable::with_capacity(config.table_capacity),
            backends: BackendPool::new(&config.backends),
            self_ip: config.self_ip,
            peer_ip: config.peer_ip,
            enabled_ports: config.enabled_ports(port_count),
            counters: Counters::default(),
            backup_tx,
            backup_rx,
            interface_mac: AtomicU64::new(0),
        }
    }

    pub fn interface_mac(&self) -> [u8; 6] {
        let packed = self.interface_mac.load(Ordering::Relaxed);
        let bytes = packed.to_be_bytes();
        [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
    }

    pub fn record_interface_mac(&self, mac: [u8; 6]) {
        let packed = u64::from_be_bytes([0, 0, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]]);
        self.interface_mac.store(packed, Ordering::Relaxed);
    }

    /// Hand a freshly installed flow to the manager slave. Returns false when
    /// the ring is full; the flow stays locally correct but unreplicated
    /// until a future probe cycle.
    pub fn enqueue_backup(&self, key: FlowKey) -> bool {
        self.backup_tx.try_send(key).is_ok()
    }

    pub fn dequeue_backup(&self) -> Option<FlowKey> {
        self.backup_rx.try_recv().ok()
    }

    pub fn pending_backups(&self) -> usize {
        self.backup_rx.len()
    }
}

/// Monotone event counters; every drop and every control action shows up
/// here. Relaxed ordering is enough, these are for observation only.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_data: AtomicU64,
    pub rx_control: AtomicU64,
    pub arp_replies: AtomicU64,
    pub syn_installs: AtomicU64,
    pub duplicate_syn: AtomicU64,
    pub insert_full: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped_no_state: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub udp_classified: AtomicU64,
    pub ring_drops: AtomicU64,
    pub probes_sent: AtomicU64,
    pub probe_requests: AtomicU64,
    pub probe_replies: AtomicU64,
    pub backups_sent: AtomicU64,
    pub backups_applied: AtomicU64,
    pub broadcasts_seen: AtomicU64,
    pub tx_incomplete: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_data: self.rx_data.load(Ordering::Relaxed),
            rx_control: self.rx_control.load(Ordering::Relaxed),
            arp_replies: self.arp_replies.load(Ordering::Relaxed),
            syn_installs: self.syn_installs.load(Ordering::Relaxed),
            duplicate_syn: self.duplicate_syn.load(Ordering::Relaxed),
            insert_full: self.insert_full.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_no_state: self.dropped_no_state.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            udp_classified: self.udp_classified.load(Ordering::Relaxed),
            ring_drops: self.ring_drops.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            probe_requests: self.probe_requests.load(Ordering::Relaxed),
            probe_replies: self.probe_replies.load(Ordering::Relaxed),
            backups_sent: self.backups_sent.load(Ordering::Relaxed),
            backups_applied: self.backups_applied.load(Ordering::Relaxed),
            broadcasts_seen: self.broadcasts_seen.load(Ordering::Relaxed),
            tx_incomplete: self.tx_incomplete.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub rx_data: u64,
    pub rx_control: u64,
    pub arp_replies: u64,
    pub syn_installs: u64,
    pub duplicate_syn: u64,
    pub insert_full: u64,
    pub forwarded: u64,
    pub dropped_no_state: u64,
    pub dropped_malformed: u64,
    pub udp_classified: u64,
    pub ring_drops: u64,
    pub probes_sent: u64,
    pub probe_requests: u64,
    pub probe_replies: u64,
    pub backups_sent: u64,
    pub backups_applied: u64,
    pub broadcasts_seen: u64,
    pub tx_incomplete: u64,
}
