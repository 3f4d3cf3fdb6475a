//! Packet I/O substrate.
//!
//! The gateway consumes a burst rx/tx device through `PortDriver`; the
//! kernel-bypass runtime behind it is not this crate's concern. All driver
//! calls are non-blocking: receive returns whatever is queued (possibly
//! nothing) and transmit may accept fewer frames than submitted, releasing
//! the rest.
//!
//! `LoopbackPort` is the in-process implementation backing tests and the
//! standalone runner: bounded per-(port, queue) rings with handles to inject
//! inbound frames and drain what the gateway transmitted.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Queue carrying flow traffic, polled by the NF worker.
pub const QUEUE_DATA: u16 = 0;
/// Queue carrying replication traffic, polled by the manager master.
pub const QUEUE_CONTROL: u16 = 1;
pub const QUEUE_COUNT: usize = 2;

/// Frames moved per burst call.
pub const BURST_SIZE: usize = 32;
/// Depth of each loopback ring.
pub const RING_CAPACITY: usize = 1024;

pub trait PortDriver: Send + Sync {
    fn port_count(&self) -> u16;

    fn mac(&self, port: u16) -> [u8; 6];

    /// Receive up to `max` frames from a queue. Never blocks.
    fn rx_burst(&self, port: u16, queue: u16, max: usize) -> Vec<Vec<u8>>;

    /// Transmit a burst; returns how many frames were accepted. Frames beyond
    /// the returned count are released by the driver.
    fn tx_burst(&self, port: u16, queue: u16, frames: Vec<Vec<u8>>) -> usize;
}

#[derive(Default)]
struct QueuePair {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
}

pub struct LoopbackPort {
    queues: Vec<[Mutex<QueuePair>; QUEUE_COUNT]>,
    macs: Vec<[u8; 6]>,
}

impl LoopbackPort {
    pub fn new(port_count: u16) -> Self {
        let queues = (0..port_count)
            .map(|_| [Mutex::new(QueuePair::default()), Mutex::new(QueuePair::default())])
            .collect();
        let macs = (0..port_count)
            .map(|port| [0x02, 0, 0, 0, 0, port as u8 + 1])
            .collect();
        Self { queues, macs }
    }

    /// Queue an inbound frame as if the wire delivered it. A full ring evicts
    /// the oldest frame.
    pub fn inject(&self, port: u16, queue: u16, frame: Vec<u8>) {
        let mut pair = self.pair(port, queue).lock();
        if pair.rx.len() >= RING_CAPACITY {
            pair.rx.pop_front();
        }
        pair.rx.push_back(frame);
    }

    /// Take everything the gateway transmitted on a queue.
    pub fn drain_tx(&self, port: u16, queue: u16) -> Vec<Vec<u8>> {
        let mut pair = self.pair(port, queue).lock();
        pair.tx.drain(..).collect()
    }

    fn pair(&self, port: u16, queue: u16) -> &Mutex<QueuePair> {
        &self.queues[port as usize][queue as usize]
    }
}

impl PortDriver for LoopbackPort {
    fn port_count(&self) -> u16 {
        self.queues.len() as u16
    }

    fn mac(&self, port: u16) -> [u8; 6] {
        self.macs[port as usize]
    }

    fn rx_burst(&self, port: u16, queue: u16, max: usize) -> Vec<Vec<u8>> {
        let mut pair = self.pair(port, queue).lock();
        let take = max.min(pair.rx.len());
        pair.rx.drain(..take).collect()
    }

    fn tx_burst(&self, port: u16, queue: u16, frames: Vec<Vec<u8>>) -> usize {
        let mut pair = self.pair(port, queue).lock();
        let mut accepted = 0;
        for frame in frames {
            if pair.tx.len() >= RING_CAPACITY {
                break;
            }
            pair.tx.push_back(frame);
            accepted += 1;
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_burst_preserves_order_and_respects_max() {
        let driver = LoopbackPort::new(1);
        for value in 0u8..5 {
            driver.inject(0, QUEUE_DATA, vec![value]);
        }
        let first = driver.rx_burst(0, QUEUE_DATA, 3);
        assert_eq!(first, vec![vec![0], vec![1], vec![2]]);
        let rest = driver.rx_burst(0, QUEUE_DATA, BURST_SIZE);
        assert_eq!(rest, vec![vec![3], vec![4]]);
        assert!(driver.rx_burst(0, QUEUE_DATA, BURST_SIZE).is_empty());
    }

    #[test]
    fn inbound_ring_evicts_oldest_when_full() {
        let driver = LoopbackPort::new(1);
        for value in 0..=RING_CAPACITY as u32 {
            driver.inject(0, QUEUE_DATA, value.to_be_bytes().to_vec());
        }
        let frames = driver.rx_burst(0, QUEUE_DATA, RING_CAPACITY);
        assert_eq!(frames.len(), RING_CAPACITY);
        assert_eq!(frames[0], 1u32.to_be_bytes().to_vec());
    }

    #[test]
    fn tx_burst_reports_shortfall_when_ring_fills() {
        let driver = LoopbackPort::new(1);
        let filler: Vec<Vec<u8>> = (0..RING_CAPACITY).map(|_| vec![0]).collect();
        assert_eq!(driver.tx_burst(0, QUEUE_DATA, filler), RING_CAPACITY);
        assert_eq!(driver.tx_burst(0, QUEUE_DATA, vec![vec![1], vec![2]]), 0);
        assert_eq!(driver.drain_tx(0, QUEUE_DATA).len(), RING_CAPACITY);
    }

    #[test]
    fn queues_are_independent() {
        let driver = LoopbackPort::new(2);
        driver.inject(0, QUEUE_DATA, vec![1]);
        driver.inject(0, QUEUE_CONTROL, vec![2]);
        driver.inject(1, QUEUE_DATA, vec![3]);
        assert_eq!(driver.rx_burst(0, QUEUE_DATA, 8), vec![vec![1]]);
        assert_eq!(driver.rx_burst(0, QUEUE_CONTROL, 8), vec![vec![2]]);
        assert_eq!(driver.rx_burst(1, QUEUE_DATA, 8), vec![vec![3]]);
    }

    #[test]
    fn port_macs_are_distinct() {
        let driver = LoopbackPort::new(2);
        assert_ne!(driver.mac(0), driver.mac(1));
    }
}
