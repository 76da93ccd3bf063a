//! The `Engine` (§9 Design Notes: "represent [the source's module-level
//! arrays] as a single owning `Engine` struct passed to all subsystems").
//!
//! Owns the relay table (the arena §9 calls for), the worker pool, and the
//! endpoint registry, and exposes every control-plane primitive named in
//! §6 as a method. Control-plane callers — an RPC service, a CLI, a test
//! — never touch a `Relay` or `Worker` directly.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::constants::{
    DEFAULT_BUFFER_SIZE, JUMBO_BUFFER_SIZE, MAX_SLAVES, N_RELAYS, REMOVAL_POLL_ATTEMPTS,
    REMOVAL_POLL_INTERVAL_MS,
};
use crate::endpoint::EndpointRegistry;
use crate::error::{RelayError, Result, StatusCode};
use crate::mempool::Mempool;
use crate::pmd::{OwnedPort, PortDriver};
use crate::relay::{NicState, PortHandle, Relay, RelayId, RxQueueConfig, VmState};
use crate::scheduler;
use crate::spinlock::{TryLock, TryLockGuard};
use crate::stats::{DirCounters, RelayRates};
use crate::topology::{CoreId, NodeId, Topology};
use crate::vhost_dev::VhostDev;
use crate::worker::{self, Worker};

/// A snapshot of one relay's counters (§4.10 `get_stats`).
#[derive(Debug, Clone, Copy)]
pub struct RelayStats {
    pub relay_id: RelayId,
    pub vm_to_nic: DirCounters,
    pub nic_to_vm: DirCounters,
}

/// Spins on a side's try-lock from the control thread. Only ever contends
/// with the worker that owns the side, and only for the duration of one
/// burst, so a bounded spin (not a blocking wait, per Design Notes'
/// "simple spinlock... try-lock only") is appropriate here too.
fn lock_side<'a, T>(lock: &'a TryLock<T>, what: &str) -> Result<TryLockGuard<'a, T>> {
    for _ in 0..(REMOVAL_POLL_ATTEMPTS * 20) {
        if let Some(guard) = lock.try_lock() {
            return Ok(guard);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(RelayError::BackendFail(format!(
        "timed out acquiring {what} side lock"
    )))
}

pub struct Engine {
    relays: Arc<Vec<Relay>>,
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    topology: Arc<dyn Topology>,
    port_driver: Arc<dyn PortDriver>,
    endpoints: EndpointRegistry,
    numa_restricted: bool,
}

impl Engine {
    /// Builds the relay table (all `N_RELAYS` slots, `UNINIT` on both
    /// sides) and spawns one pinned worker per `config.worker_cores`
    /// (§3: relays are "created at process init, destroyed at shutdown;
    /// contents mutate").
    pub fn new(
        config: &EngineConfig,
        topology: Arc<dyn Topology>,
        port_driver: Arc<dyn PortDriver>,
    ) -> Self {
        let buffer_size = if config.jumbo {
            JUMBO_BUFFER_SIZE
        } else {
            DEFAULT_BUFFER_SIZE
        };
        let relays: Vec<Relay> = (0..N_RELAYS)
            .map(|id| Relay::new(id as RelayId, Mempool::new(0, buffer_size), 0, config.jumbo))
            .collect();
        let relays = Arc::new(relays);

        let workers: Vec<Arc<Worker>> = config.worker_cores.iter().map(|&c| Worker::new(c)).collect();
        let handles = workers
            .iter()
            .cloned()
            .map(|w| worker::spawn(w, relays.clone()))
            .collect();

        Self {
            relays,
            workers,
            handles: Mutex::new(handles),
            topology,
            port_driver,
            endpoints: EndpointRegistry::new(N_RELAYS),
            numa_restricted: config.numa_restricted,
        }
    }

    fn relay(&self, id: RelayId) -> Result<&Relay> {
        self.relays
            .get(id as usize)
            .ok_or_else(|| RelayError::InvalidArg(format!("relay id {id} out of range")))
    }

    fn worker_for(&self, core: CoreId) -> Option<&Arc<Worker>> {
        self.workers.iter().find(|w| w.core_id == core)
    }

    fn raise_update(&self, core: CoreId) {
        if let Some(w) = self.worker_for(core) {
            w.raise_update_needed();
        }
    }

    fn wait_for<F: Fn() -> bool>(&self, done: F) -> bool {
        for _ in 0..REMOVAL_POLL_ATTEMPTS {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(REMOVAL_POLL_INTERVAL_MS));
        }
        done()
    }

    // ---- §6 control-plane primitives -----------------------------------

    /// `add_vf(pci_addr, relay_id, conditional)` (§4.1, §4.7).
    pub fn add_vf(&self, pci_addr: &str, relay_id: RelayId, conditional: bool) -> Result<StatusCode> {
        let relay = self.relay(relay_id)?;
        if !relay.nic.state.get().can_attach() {
            if conditional {
                let inner = lock_side(&relay.nic.lock, "nic")?;
                if !inner.is_bond && inner.pci_addr == pci_addr {
                    return Ok(0);
                }
            }
            return Err(RelayError::AlreadyBound(format!(
                "relay {relay_id} nic side already bound"
            )));
        }

        let owned = OwnedPort::attach(self.port_driver.clone(), pci_addr)?;
        if let Err(e) = self.port_driver.configure_queues(owned.id(), &relay.mempool()) {
            return Err(e);
        }

        let cpu = scheduler::select_core(self.topology.as_ref(), &self.relays, Some(relay.mempool_node()))?;

        let next_state = if relay.vm.state.get() == VmState::Ready {
            if let Err(e) = self.port_driver.start(owned.id()) {
                return Err(e);
            }
            NicState::Ready
        } else {
            NicState::Added
        };

        relay.nic.cpu.set(Some(cpu));
        relay.nic.port.store(Some(Arc::new(PortHandle {
            driver: self.port_driver.clone(),
            id: owned.id(),
        })));
        {
            let mut inner = lock_side(&relay.nic.lock, "nic")?;
            inner.is_bond = false;
            inner.pci_addr = pci_addr.to_string();
            inner.port = Some(owned);
        }
        relay.nic.state.set(next_state);
        self.raise_update(cpu);
        info!(relay = relay_id, pci_addr, cpu, "vf attached");
        Ok(0)
    }

    /// `add_bond(slaves, name, mode, relay_id)` (§4.7).
    pub fn add_bond(&self, slaves: &[String], name: &str, mode: u8, relay_id: RelayId) -> Result<StatusCode> {
        if slaves.is_empty() || slaves.len() > MAX_SLAVES {
            return Err(RelayError::InvalidArg(format!(
                "bond slave count {} out of range (1..={MAX_SLAVES})",
                slaves.len()
            )));
        }
        let relay = self.relay(relay_id)?;
        if !relay.nic.state.get().can_attach() {
            return Err(RelayError::AlreadyBound(format!(
                "relay {relay_id} nic side already bound"
            )));
        }

        // Attach every slave independently, then the bond itself; any
        // partial attach unwinds via `OwnedPort`'s drop.
        let mut attached_slaves = Vec::with_capacity(slaves.len());
        for slave in slaves {
            attached_slaves.push(OwnedPort::attach(self.port_driver.clone(), slave)?);
        }
        let bond_port = OwnedPort::attach(self.port_driver.clone(), name)?;

        if let Err(e) = self.port_driver.configure_queues(bond_port.id(), &relay.mempool()) {
            return Err(e);
        }

        let cpu = scheduler::select_core(self.topology.as_ref(), &self.relays, Some(relay.mempool_node()))?;

        let next_state = if relay.vm.state.get() == VmState::Ready {
            if let Err(e) = self.port_driver.start(bond_port.id()) {
                return Err(e);
            }
            NicState::Ready
        } else {
            NicState::Added
        };

        relay.nic.cpu.set(Some(cpu));
        relay.nic.port.store(Some(Arc::new(PortHandle {
            driver: self.port_driver.clone(),
            id: bond_port.id(),
        })));
        {
            let mut inner = lock_side(&relay.nic.lock, "nic")?;
            inner.is_bond = true;
            inner.pci_addr = name.to_string();
            inner.port = Some(bond_port);
            inner.slaves = attached_slaves;
        }
        relay.nic.state.set(next_state);
        self.raise_update(cpu);
        info!(relay = relay_id, name, mode, slaves = slaves.len(), "bond attached");
        Ok(0)
    }

    /// `remove_vf(pci_addr, relay_id, conditional)` (§4.1, §4.7). Also used
    /// internally to tear down a bond: the worker's final drain
    /// (`forward.rs`'s `Removing2`/no-vm-worker branches) clears
    /// `nic.lock.is_bond`'s slaves before the bond port itself, matching
    /// §4.7's "detach every slave first, then free the bond."
    pub fn remove_vf(&self, pci_addr: &str, relay_id: RelayId, conditional: bool) -> Result<StatusCode> {
        let relay = self.relay(relay_id)?;
        let cur = relay.nic.state.get();
        if !cur.can_detach() {
            if conditional && cur == NicState::Uninit {
                return Ok(0);
            }
            return Err(RelayError::NotBound(format!(
                "relay {relay_id} nic side not bound"
            )));
        }
        if !conditional {
            let inner = lock_side(&relay.nic.lock, "nic")?;
            if inner.pci_addr != pci_addr {
                return Err(RelayError::InvalidArg(format!(
                    "relay {relay_id} nic side bound to a different address"
                )));
            }
        }

        relay.nic.state.set(NicState::Removing1);
        if let Some(cpu) = relay.vm.cpu.get() {
            self.raise_update(cpu);
        }
        if let Some(cpu) = relay.nic.cpu.get() {
            self.raise_update(cpu);
        }

        if self.wait_for(|| relay.nic.state.get() == NicState::Uninit) {
            info!(relay = relay_id, "nic side removed");
            Ok(0)
        } else {
            warn!(relay = relay_id, "remove_vf: cooperative teardown timed out, proceeding");
            Err(RelayError::Timeout(format!(
                "relay {relay_id} nic side did not reach UNINIT within the poll budget"
            )))
        }
    }

    /// `add_virtio(dev, relay_id)` (§4.1, §4.6). `explicit_cpu` realizes
    /// "if the control call supplied an explicit pin" (§4.5); `conditional`
    /// is not part of §6's literal signature for this call but is accepted
    /// here to give it the same idempotent-repeat behavior as `add_vf`.
    pub fn add_virtio(
        &self,
        dev: Arc<dyn VhostDev>,
        relay_id: RelayId,
        explicit_cpu: Option<CoreId>,
        conditional: bool,
    ) -> Result<StatusCode> {
        let relay = self.relay(relay_id)?;
        if !relay.vm.state.get().can_attach() {
            if conditional {
                let same = relay
                    .vm
                    .dev
                    .load_full()
                    .map(|d| d.get_ifname() == dev.get_ifname())
                    .unwrap_or(false);
                if same {
                    return Ok(0);
                }
            }
            return Err(RelayError::AlreadyBound(format!(
                "relay {relay_id} vm side already bound"
            )));
        }

        // §4.6 NUMA/mempool migration.
        if let Some(guest_node) = dev.get_numa_node() {
            if guest_node != relay.mempool_node() {
                if self.numa_restricted {
                    warn!(
                        relay = relay_id,
                        guest_node, "refusing NUMA migration: numa-restricted mode"
                    );
                } else if relay.nic.state.get() == NicState::Ready {
                    warn!(
                        relay = relay_id,
                        guest_node, "refusing NUMA migration: nic side already READY"
                    );
                } else {
                    let new_pool = Mempool::new(guest_node, relay.mempool().buffer_size());
                    if relay.nic.state.get() == NicState::Added {
                        if let Some(port) = relay.nic.port.load_full() {
                            self.port_driver.stop(port.id)?;
                            self.port_driver.configure_queues(port.id, &new_pool)?;
                        }
                    }
                    relay.migrate_mempool(new_pool, guest_node);
                    info!(relay = relay_id, guest_node, "migrated mempool to guest NUMA node");
                }
            }
        }

        let cpu = match explicit_cpu {
            Some(c) => scheduler::validate_pin(self.topology.as_ref(), c)?,
            None => {
                scheduler::select_core(self.topology.as_ref(), &self.relays, Some(relay.mempool_node()))?
            }
        };

        let max_qp = (dev.get_vring_count() / 2).max(1);
        relay.vm.dev.store(Some(dev));
        relay.vm.rx_queues.store(Arc::new(RxQueueConfig::single_queue()));
        {
            let mut inner = lock_side(&relay.vm.lock, "vm")?;
            inner.max_qp = max_qp;
            inner.tx_q_bitmap = 1;
            inner.tx_q_rr = 0;
        }
        relay.vm.cpu.set(Some(cpu));
        relay.vm.state.set(VmState::Ready);

        if relay.nic.state.get() == NicState::Added {
            if let Some(port) = relay.nic.port.load_full() {
                self.port_driver.start(port.id)?;
            }
            relay.nic.state.set(NicState::Ready);
            if let Some(nic_cpu) = relay.nic.cpu.get() {
                self.raise_update(nic_cpu);
            }
        }

        self.raise_update(cpu);
        info!(relay = relay_id, cpu, max_qp, "virtio device attached");
        Ok(0)
    }

    /// `remove_virtio(relay_id)` (§4.1). `void` per §6: a timeout is
    /// logged, not surfaced, since there is no status slot to carry it.
    pub fn remove_virtio(&self, relay_id: RelayId) -> Result<()> {
        let relay = self.relay(relay_id)?;
        if !relay.vm.state.get().can_detach() {
            return Err(RelayError::NotBound(format!(
                "relay {relay_id} vm side not bound"
            )));
        }

        relay.vm.state.set(VmState::Removing1);
        if let Some(cpu) = relay.vm.cpu.get() {
            self.raise_update(cpu);
        }
        if let Some(cpu) = relay.nic.cpu.get() {
            self.raise_update(cpu);
        }

        if self.wait_for(|| relay.vm.state.get() == VmState::Uninit) {
            info!(relay = relay_id, "vm side removed");
        } else {
            warn!(relay = relay_id, "remove_virtio: cooperative teardown timed out, proceeding");
        }
        Ok(())
    }

    /// `vring_state_change(relay_id, q_id, enable)` (§6). Toggles queue
    /// pair `q_id` in both the vm-side tx bitmap (§4.2) and the nic→vm
    /// steering bitmap (§4.3's `rx_q_bitmap`).
    pub fn vring_state_change(&self, relay_id: RelayId, q_id: u16, enable: bool) -> Result<()> {
        let relay = self.relay(relay_id)?;
        if relay.vm.state.get() != VmState::Ready {
            return Err(RelayError::NotBound(format!(
                "relay {relay_id} vm side is not READY"
            )));
        }
        let bit = 1u32 << (q_id.min(31));

        {
            let mut inner = lock_side(&relay.vm.lock, "vm")?;
            inner.tx_q_bitmap = if enable {
                inner.tx_q_bitmap | bit
            } else {
                inner.tx_q_bitmap & !bit
            };
        }

        let new_bitmap = {
            let cur = relay.vm.rx_queues.load();
            if enable { cur.bitmap | bit } else { cur.bitmap & !bit }
        };
        relay.vm.rx_queues.store(Arc::new(RxQueueConfig::from_bitmap(new_bitmap)));

        if let Some(cpu) = relay.vm.cpu.get() {
            self.raise_update(cpu);
        }
        if let Some(cpu) = relay.nic.cpu.get() {
            self.raise_update(cpu);
        }
        Ok(())
    }

    /// `migrate_cpus(relay_id, new_vm_cpu, new_nic_cpu)` (§4.5).
    pub fn migrate_cpus(
        &self,
        relay_id: RelayId,
        new_vm_cpu: Option<CoreId>,
        new_nic_cpu: Option<CoreId>,
    ) -> Result<StatusCode> {
        let relay = self.relay(relay_id)?;

        if let Some(c) = new_vm_cpu {
            if !relay.vm.state.get().is_operational() {
                return Err(RelayError::NotBound(format!(
                    "relay {relay_id} vm side is not READY"
                )));
            }
            let validated = scheduler::validate_pin(self.topology.as_ref(), c)?;
            let old = relay.vm.cpu.get();
            relay.vm.cpu.set(Some(validated));
            if let Some(old_cpu) = old {
                self.raise_update(old_cpu);
            }
            self.raise_update(validated);
        }

        if let Some(c) = new_nic_cpu {
            let nic_state = relay.nic.state.get();
            if !matches!(nic_state, NicState::Added | NicState::Ready) {
                return Err(RelayError::NotBound(format!(
                    "relay {relay_id} nic side is not ADDED/READY"
                )));
            }
            let validated = scheduler::validate_pin(self.topology.as_ref(), c)?;
            let old = relay.nic.cpu.get();
            relay.nic.cpu.set(Some(validated));
            if let Some(old_cpu) = old {
                self.raise_update(old_cpu);
            }
            self.raise_update(validated);
        }

        info!(relay = relay_id, ?new_vm_cpu, ?new_nic_cpu, "migrated cpu pins");
        Ok(0)
    }

    /// `add_sock_dev_pair(path, slaves, name, mode, conditional)` (§4.10).
    #[allow(clippy::too_many_arguments)]
    pub fn add_sock_dev_pair(
        &self,
        path: &str,
        slaves: &[String],
        name: &str,
        mode: u8,
        relay_id: RelayId,
        conditional: bool,
    ) -> Result<StatusCode> {
        if conditional && self.endpoints.relay_for(path) == Some(relay_id) {
            return Ok(0);
        }

        let status = if slaves.len() == 1 {
            self.add_vf(&slaves[0], relay_id, conditional)?
        } else {
            self.add_bond(slaves, name, mode, relay_id)?
        };

        if let Err(e) = self.endpoints.register(path, relay_id) {
            warn!(
                relay = relay_id,
                path, "endpoint registration failed, rolling back port attach"
            );
            let _ = self.remove_vf("", relay_id, true);
            return Err(e);
        }

        Ok(status)
    }

    /// `remove_sock_dev_pair(path, conditional)` (§4.10).
    pub fn remove_sock_dev_pair(&self, path: &str, conditional: bool) -> Result<StatusCode> {
        let relay_id = match self.endpoints.relay_for(path) {
            Some(id) => id,
            None if conditional => return Ok(0),
            None => {
                return Err(RelayError::NotBound(format!(
                    "no relay bound to endpoint {path}"
                )));
            }
        };

        let status = self.remove_vf("", relay_id, true)?;
        let _ = self.endpoints.deregister(path);
        Ok(status)
    }

    /// Current cpu pin of each side, for diagnostics and tests; not part
    /// of §6's primitive list.
    pub fn cpu_pins(&self, relay_id: RelayId) -> Result<(Option<CoreId>, Option<CoreId>)> {
        let relay = self.relay(relay_id)?;
        Ok((relay.vm.cpu.get(), relay.nic.cpu.get()))
    }

    /// Current mempool NUMA node, for diagnostics and tests (§4.6).
    pub fn mempool_node(&self, relay_id: RelayId) -> Result<NodeId> {
        Ok(self.relay(relay_id)?.mempool_node())
    }

    /// `get_stats(relay_id)` (§4.10): a non-mutating snapshot.
    pub fn get_stats(&self, relay_id: RelayId) -> Result<RelayStats> {
        let relay = self.relay(relay_id)?;
        Ok(RelayStats {
            relay_id,
            vm_to_nic: relay.counters.vm_to_nic.load(),
            nic_to_vm: relay.counters.nic_to_vm.load(),
        })
    }

    /// `reset_rate_stats(delay_ms)` (§4.10, §9 "Counter rates"): sleeps on
    /// the control thread for `delay_ms`, then returns `(current -
    /// snapshot) / elapsed` per relay, resetting the snapshot as a side
    /// effect whether or not the caller reads the result.
    pub fn reset_rate_stats(&self, delay_ms: u64) -> Vec<(RelayId, RelayRates)> {
        std::thread::sleep(Duration::from_millis(delay_ms));
        let now = Instant::now();
        self.relays.iter().map(|r| (r.id, r.rates(now))).collect()
    }

    /// Stops every worker and drains any packets still cached on any
    /// relay (§4.4 Cancellation: "on exit, any cached packets still in a
    /// relay are freed by the final removal path").
    pub fn shutdown(self) {
        for w in &self.workers {
            w.request_stop();
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
        for relay in self.relays.iter() {
            if let Some(mut vm) = relay.vm.lock.try_lock() {
                vm.drain_cache();
            }
            relay.vm.dev.store(None);
            if let Some(mut nic) = relay.nic.lock.try_lock() {
                nic.drain_cache();
                nic.slaves.clear();
                nic.port = None;
            }
            relay.nic.port.store(None);
        }
    }
}
