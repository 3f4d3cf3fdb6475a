//! Process-wide configuration, fixed at startup.

use smallvec::SmallVec;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Hard cap on the backend pool.
pub const MAX_BACKENDS: usize = 16;
/// Default flow-table preallocation.
pub const DEFAULT_TABLE_CAPACITY: usize = 10_000;
/// Default depth of the NF→manager backup-request ring.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port mask enables no ports")]
    NoPorts,
    #[error("backend pool is empty")]
    NoBackends,
    #[error("backend pool holds {0} entries, cap is {MAX_BACKENDS}")]
    TooManyBackends(usize),
    #[error("table capacity must be non-zero")]
    ZeroTableCapacity,
    #[error("ring capacity must be non-zero")]
    ZeroRingCapacity,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bitmask of enabled ports; bit N enables port N.
    pub port_mask: u32,
    /// This gateway's address on the control subnet.
    pub self_ip: Ipv4Addr,
    /// The sibling gateway.
    pub peer_ip: Ipv4Addr,
    /// Backend servers new flows are rotated across.
    pub backends: Vec<Ipv4Addr>,
    pub table_capacity: usize,
    pub ring_capacity: usize,
}

impl GatewayConfig {
    pub fn new(self_ip: Ipv4Addr, peer_ip: Ipv4Addr, backends: Vec<Ipv4Addr>) -> Self {
        Self {
            port_mask: 0x1,
            self_ip,
            peer_ip,
            backends,
            table_capacity: DEFAULT_TABLE_CAPACITY,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_mask == 0 {
            return Err(ConfigError::NoPorts);
        }
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.backends.len() > MAX_BACKENDS {
            return Err(ConfigError::TooManyBackends(self.backends.len()));
        }
        if self.table_capacity == 0 {
            return Err(ConfigError::ZeroTableCapacity);
        }
        if self.ring_capacity == 0 {
            return Err(ConfigError::ZeroRingCapacity);
        }
        Ok(())
    }

    /// The ports this gateway polls: mask bits intersected with the ports the
    /// driver actually exposes.
    pub fn enabled_ports(&self, port_count: u16) -> Vec<u16> {
        (0..port_count.min(32))
            .filter(|port| self.port_mask & (1 << port) != 0)
            .collect()
    }
}

/// Fixed backend pool; new flows take `pool[counter mod len]`.
#[derive(Debug, Clone)]
pub struct BackendPool {
    addrs: SmallVec<[Ipv4Addr; MAX_BACKENDS]>,
}

impl BackendPool {
    pub fn new(addrs: &[Ipv4Addr]) -> Self {
        Self {
            addrs: SmallVec::from_slice(addrs),
        }
    }

    pub fn select(&self, counter: u64) -> Ipv4Addr {
        self.addrs[(counter % self.addrs.len() as u64) as usize]
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GatewayConfig {
        GatewayConfig::new(
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            vec![Ipv4Addr::new(10, 1, 0, 1)],
        )
    }

    #[test]
    fn default_config_validates() {
        assert_eq!(base().validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_port_mask_and_backends() {
        let mut config = base();
        config.port_mask = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoPorts));

        let mut config = base();
        config.backends.clear();
        assert_eq!(config.validate(), Err(ConfigError::NoBackends));

        let mut config = base();
        config.backends = vec![Ipv4Addr::UNSPECIFIED; MAX_BACKENDS + 1];
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyBackends(MAX_BACKENDS + 1))
        );
    }

    #[test]
    fn rejects_zero_capacities() {
        let mut config = base();
        config.table_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTableCapacity));

        let mut config = base();
        config.ring_capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroRingCapacity));
    }

    #[test]
    fn enabled_ports_intersect_mask_with_driver() {
        let mut config = base();
        config.port_mask = 0b101;
        assert_eq!(config.enabled_ports(4), vec![0, 2]);
        assert_eq!(config.enabled_ports(1), vec![0]);
    }

    #[test]
    fn backend_rotation_wraps() {
        let pool = BackendPool::new(&[Ipv4Addr::new(10, 1, 0, 1), Ipv4Addr::new(10, 1, 0, 2)]);
        assert_eq!(pool.select(0), Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(pool.select(1), Ipv4Addr::new(10, 1, 0, 2));
        assert_eq!(pool.select(2), Ipv4Addr::new(10, 1, 0, 1));
    }
}
