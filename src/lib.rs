//! Userspace L4 load-balancing gateway.
//!
//! Three workers share one flow table and one backup-request ring: the NF
//! worker pins new TCP flows to backends and rewrites traffic, the manager
//! master speaks the replication protocol with the peer gateway, and the
//! manager slave probes the ECMP fabric for every new flow. `Gateway` wires
//! them to a `PortDriver` and runs each on its own thread.

pub mod config;
pub mod ctx;
pub mod logger;
pub mod manager;
pub mod nf;
pub mod port;
pub mod table;
pub mod wire;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ConfigError, GatewayConfig};
pub use ctx::{CounterSnapshot, GatewayCtx};
pub use port::{LoopbackPort, PortDriver};
pub use table::{FlowKey, FlowState, FlowTable, InsertError};

use crate::manager::slave::ManagerSlave;
use crate::manager::ManagerMaster;
use crate::nf::NfWorker;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct Gateway<D: PortDriver + 'static> {
    ctx: Arc<GatewayCtx>,
    driver: Arc<D>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: PortDriver + 'static> Gateway<D> {
    pub fn new(config: GatewayConfig, driver: Arc<D>) -> anyhow::Result<Self> {
        config.validate()?;
        let ctx = Arc::new(GatewayCtx::new(&config, driver.port_count()));
        if ctx.enabled_ports.is_empty() {
            anyhow::bail!("port mask selects no port the driver exposes");
        }
        logger::info(format!(
            "gateway {} (peer {}) on ports {:?}, {} backend(s), table capacity {}",
            ctx.self_ip,
            ctx.peer_ip,
            ctx.enabled_ports,
            ctx.backends.len(),
            ctx.table.capacity(),
        ));
        Ok(Self {
            ctx,
            driver,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn ctx(&self) -> &Arc<GatewayCtx> {
        &self.ctx
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Spawn the three workers. Each runs an infinite non-blocking poll loop
    /// until `stop`; core pinning is left to the deployment.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            anyhow::bail!("gateway already started");
        }
        self.running.store(true, Ordering::SeqCst);

        let (ctx, driver, running) = self.worker_parts();
        workers.push(
            std::thread::Builder::new()
                .name("gw-nf".into())
                .spawn(move || NfWorker::new(ctx, driver).run(&running))?,
        );

        let (ctx, driver, running) = self.worker_parts();
        workers.push(
            std::thread::Builder::new()
                .name("gw-manager".into())
                .spawn(move || ManagerMaster::new(ctx, driver).run(&running))?,
        );

        let (ctx, driver, running) = self.worker_parts();
        workers.push(
            std::thread::Builder::new()
                .name("gw-slave".into())
                .spawn(move || ManagerSlave::new(ctx, driver).run(&running))?,
        );

        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }

    fn worker_parts(&self) -> (Arc<GatewayCtx>, Arc<D>, Arc<AtomicBool>) {
        (
            Arc::clone(&self.ctx),
            Arc::clone(&self.driver),
            Arc::clone(&self.running),
        )
    }
}

impl<D: PortDriver + 'static> Drop for Gateway<D> {
    fn drop(&mut self) {
        self.stop();
    }
}
