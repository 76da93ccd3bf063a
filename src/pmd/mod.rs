//! Typed interface over the underlying poll-mode-driver library (§6).
//!
//! The underlying library (port attach/detach/start/stop, rx/tx burst,
//! mempool create/free) is treated as an external C library. No DPDK
//! binding crate exists in this codebase's dependency ecosystem, so this
//! module is a genuine Rust trait — `PortDriver` — with a reference
//! software implementation, [`softnic::SoftPortDriver`], built on
//! `AF_PACKET` sockets for non-blocking scatter-gather I/O.

pub mod softnic;

use crate::error::Result;
use crate::mempool::{Mempool, Packet};

/// Opaque handle to an attached port (a VF, or a bonded group of VFs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

pub trait PortDriver: Send + Sync {
    /// Attach `name` (a PCI address or bond interface name) and return a
    /// handle. `BackendFail` on any underlying driver error.
    fn attach(&self, name: &str) -> Result<PortId>;

    /// Detach a previously attached port. Idempotent-safe: callers only
    /// ever detach a port exactly once (enforced by [`OwnedPort`]).
    fn detach(&self, port: PortId);

    /// Bind the port's rx/tx queues to `mempool`'s geometry.
    fn configure_queues(&self, port: PortId, mempool: &Mempool) -> Result<()>;

    fn start(&self, port: PortId) -> Result<()>;
    fn stop(&self, port: PortId) -> Result<()>;

    /// Receive up to `max` packets from `queue`, allocating each from
    /// `mempool`. Returns fewer than `max` if none are currently available
    /// (never blocks).
    fn rx_burst(&self, port: PortId, queue: u16, max: usize, mempool: &Mempool) -> Vec<Packet>;

    /// Send as many packets as possible from the front of `pkts`, removing
    /// each one sent. Returns `(packets_sent, bytes_sent)`.
    fn tx_burst(&self, port: PortId, queue: u16, pkts: &mut Vec<Packet>) -> (usize, u64);
}

/// Scoped-release guard around an attached port (Design Notes: "manual
/// reference types"). Detaches via the owning driver on drop unless
/// [`OwnedPort::into_raw`] extracts the id first.
pub struct OwnedPort {
    driver: std::sync::Arc<dyn PortDriver>,
    port: Option<PortId>,
}

impl OwnedPort {
    pub fn attach(driver: std::sync::Arc<dyn PortDriver>, name: &str) -> Result<Self> {
        let port = driver.attach(name)?;
        Ok(Self {
            driver,
            port: Some(port),
        })
    }

    pub fn id(&self) -> PortId {
        self.port.expect("OwnedPort used after extraction")
    }

    pub fn driver(&self) -> &dyn PortDriver {
        self.driver.as_ref()
    }

    /// Extract the raw id without releasing it; the caller now owns the
    /// release (used when a port is being re-homed into a bond).
    pub fn into_raw(mut self) -> PortId {
        self.port.take().expect("OwnedPort used after extraction")
    }
}

impl Drop for OwnedPort {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.driver.detach(port);
        }
    }
}
