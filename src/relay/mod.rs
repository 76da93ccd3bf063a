//! The relay record (§3 Data Model) and the two attachment sides.
//!
//! A `Relay` couples one vm-side and one nic-side. Each side splits its
//! state into two parts:
//! - a lock-free, atomically published part read by the *opposite*
//!   direction's worker every tick without ever taking this side's
//!   try-lock (cpu pin, attachment state, the device/port handle, and —
//!   for the vm side — the rx-queue steering table `nic_to_vm` needs for
//!   RSS);
//! - a try-lock-guarded `Inner` touched only by the owning worker and by
//!   control-plane calls (queue round-robin position, the packet cache,
//!   bond/port lifecycle, live-migration flag).
//!
//! The relay table itself (the "arena" Design Notes calls for) lives in
//! `engine.rs`; this module only defines what one slot holds.

pub mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::constants::MAX_QP;
use crate::mempool::{Mempool, Packet};
use crate::pmd::{OwnedPort, PortDriver, PortId};
use crate::stats::{AtomicDirCounters, RateTracker, RelayRates};
use crate::topology::{CoreId, NodeId};
use crate::vhost_dev::VhostDev;

pub use state::{AtomicNicState, AtomicVmState, NicState, VmState};

pub type RelayId = u32;

const NO_CORE: u64 = u64::MAX;

fn encode_cpu(cpu: Option<CoreId>) -> u64 {
    cpu.map(|c| c as u64).unwrap_or(NO_CORE)
}

fn decode_cpu(v: u64) -> Option<CoreId> {
    if v == NO_CORE { None } else { Some(v as CoreId) }
}

/// An atomically readable/writable `Option<CoreId>`, checked by a worker
/// without taking the owning side's lock (§4.4's `relay.vm.cpu == self.core`
/// guard runs before `try_lock`).
#[derive(Debug, Default)]
pub struct CpuPin(AtomicU64);

impl CpuPin {
    pub fn new(cpu: Option<CoreId>) -> Self {
        Self(AtomicU64::new(encode_cpu(cpu)))
    }

    pub fn get(&self) -> Option<CoreId> {
        decode_cpu(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, cpu: Option<CoreId>) {
        self.0.store(encode_cpu(cpu), Ordering::Release);
    }
}

/// Receive-queue steering table (§3 invariant: `rx_q_active ==
/// popcount(rx_q_bitmap)`, `rx_q_lut[0..rx_q_active]` ascending, `pow2_queues
/// ⇔ rx_q_active` a power of two). Published as one `Arc` swap so a reader
/// never observes a bitmap from one update paired with a lut from another.
#[derive(Clone)]
pub struct RxQueueConfig {
    pub bitmap: u32,
    pub active: u32,
    pub lut: [u16; MAX_QP],
    pub pow2: bool,
}

impl RxQueueConfig {
    pub fn from_bitmap(bitmap: u32) -> Self {
        let active = bitmap.count_ones();
        let mut lut = [0u16; MAX_QP];
        let mut i = 0usize;
        for bit in 0..32u32 {
            if bitmap & (1 << bit) != 0 {
                if i < MAX_QP {
                    lut[i] = bit as u16;
                }
                i += 1;
            }
        }
        let pow2 = active != 0 && (active & (active - 1)) == 0;
        Self { bitmap, active, lut, pow2 }
    }

    pub fn single_queue() -> Self {
        Self::from_bitmap(1)
    }
}

/// Lock-free handle to an attached nic-side port, published by control-plane
/// transitions and consumed by `vm_to_nic` (run by the vm-side worker,
/// which never holds `nic.lock`).
pub struct PortHandle {
    pub driver: Arc<dyn PortDriver>,
    pub id: PortId,
}

/// Mutable vm-side state touched only by the owning worker or a
/// control-plane call holding `VmSide::lock`.
pub struct VmSideInner {
    pub max_qp: u16,
    pub tx_q_bitmap: u32,
    pub tx_q_rr: u16,
    pub cached_pkts: Vec<Packet>,
    pub lm_pending: bool,
}

impl VmSideInner {
    fn uninit() -> Self {
        Self {
            max_qp: 1,
            tx_q_bitmap: 0,
            tx_q_rr: 0,
            cached_pkts: Vec::new(),
            lm_pending: false,
        }
    }

    /// Frees every cached packet, returning how many were dropped. Used by
    /// every teardown/not-ready path that must not leak buffers.
    pub fn drain_cache(&mut self) -> usize {
        let n = self.cached_pkts.len();
        self.cached_pkts.clear();
        n
    }

    /// Advances `tx_q_rr` to the next set bit of `tx_q_bitmap` (mod
    /// `max_qp`), for fairness across active tx queues (§4.2 step 1).
    pub fn advance_tx_q_rr(&mut self) -> Option<u16> {
        if self.tx_q_bitmap == 0 {
            return None;
        }
        let qp = self.max_qp.max(1);
        for step in 1..=qp {
            let next = (self.tx_q_rr + step) % qp;
            if self.tx_q_bitmap & (1 << next) != 0 {
                self.tx_q_rr = next;
                return Some(next);
            }
        }
        None
    }
}

/// Mutable nic-side state touched only by the owning worker or a
/// control-plane call holding `NicSide::lock`.
pub struct NicSideInner {
    pub is_bond: bool,
    /// Individually-attached bond members (§4.7). Empty for a plain VF.
    /// Not addressable by packet counters; kept only so teardown can
    /// detach each slave before freeing the bond port. Declared ahead of
    /// `port` so this field's `Drop` also runs first, matching §4.7's
    /// "detach every slave first, then free the bond" even on a path that
    /// doesn't explicitly clear both fields in order.
    pub slaves: Vec<OwnedPort>,
    pub port: Option<OwnedPort>,
    pub pci_addr: String,
    pub cached_pkts: Vec<Packet>,
}

impl NicSideInner {
    fn uninit() -> Self {
        Self {
            is_bond: false,
            port: None,
            slaves: Vec::new(),
            pci_addr: String::new(),
            cached_pkts: Vec::new(),
        }
    }

    pub fn drain_cache(&mut self) -> usize {
        let n = self.cached_pkts.len();
        self.cached_pkts.clear();
        n
    }
}

pub struct VmSide {
    pub cpu: CpuPin,
    pub state: AtomicVmState,
    pub dev: ArcSwapOption<dyn VhostDev>,
    pub rx_queues: ArcSwap<RxQueueConfig>,
    pub lock: crate::spinlock::TryLock<VmSideInner>,
}

impl Default for VmSide {
    fn default() -> Self {
        Self {
            cpu: CpuPin::new(None),
            state: AtomicVmState::new(VmState::Uninit),
            dev: ArcSwapOption::from(None),
            rx_queues: ArcSwap::from_pointee(RxQueueConfig::single_queue()),
            lock: crate::spinlock::TryLock::new(VmSideInner::uninit()),
        }
    }
}

pub struct NicSide {
    pub cpu: CpuPin,
    pub state: AtomicNicState,
    pub port: ArcSwapOption<PortHandle>,
    pub lock: crate::spinlock::TryLock<NicSideInner>,
}

impl Default for NicSide {
    fn default() -> Self {
        Self {
            cpu: CpuPin::new(None),
            state: AtomicNicState::new(NicState::Uninit),
            port: ArcSwapOption::from(None),
            lock: crate::spinlock::TryLock::new(NicSideInner::uninit()),
        }
    }
}

/// Per-direction packet counters for one relay.
#[derive(Default)]
pub struct RelayCounters {
    pub vm_to_nic: AtomicDirCounters,
    pub nic_to_vm: AtomicDirCounters,
}

/// One configured relay: a vm-side, a nic-side, their shared counters and
/// packet pool. Everything here is `Send + Sync`; the relay table holds
/// these behind a plain index, never a pointer back into a worker (Design
/// Notes: "arena + index").
pub struct Relay {
    pub id: RelayId,
    pub vm: VmSide,
    pub nic: NicSide,
    pub counters: RelayCounters,
    pub rates: RateTracker,
    pub use_jumbo: bool,
    mempool: ArcSwap<Mempool>,
    mempool_node: AtomicU64,
}

impl Relay {
    pub fn new(id: RelayId, mempool: Mempool, mempool_node: NodeId, use_jumbo: bool) -> Self {
        Self {
            id,
            vm: VmSide::default(),
            nic: NicSide::default(),
            counters: RelayCounters::default(),
            rates: RateTracker::new(std::time::Instant::now()),
            use_jumbo,
            mempool: ArcSwap::from_pointee(mempool),
            mempool_node: AtomicU64::new(mempool_node as u64),
        }
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        self.mempool.load_full()
    }

    pub fn mempool_node(&self) -> NodeId {
        self.mempool_node.load(Ordering::Acquire) as NodeId
    }

    /// Swaps in a newly allocated pool on `node`, returning the old one so
    /// the caller can assert it drains to zero outstanding buffers (§4.6,
    /// invariant 7).
    pub fn migrate_mempool(&self, new_pool: Mempool, node: NodeId) -> Arc<Mempool> {
        let old = self.mempool.swap(Arc::new(new_pool));
        self.mempool_node.store(node as u64, Ordering::Release);
        old
    }

    /// A relay is operational iff both sides are `READY` (§3 invariant).
    pub fn is_operational(&self) -> bool {
        self.vm.state.get().is_operational() && self.nic.state.get().is_operational()
    }

    pub fn rates(&self, now: std::time::Instant) -> RelayRates {
        self.rates
            .compute_and_reset_rates(&self.counters.vm_to_nic, &self.counters.nic_to_vm, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_pin_round_trips_through_atomics() {
        let pin = CpuPin::new(None);
        assert_eq!(pin.get(), None);
        pin.set(Some(3));
        assert_eq!(pin.get(), Some(3));
        pin.set(None);
        assert_eq!(pin.get(), None);
    }

    #[test]
    fn rx_queue_config_matches_bitmap() {
        let cfg = RxQueueConfig::from_bitmap(0b1011);
        assert_eq!(cfg.active, 3);
        assert_eq!(&cfg.lut[..3], &[0, 1, 3]);
        assert!(!cfg.pow2);

        let cfg = RxQueueConfig::from_bitmap(0b0100);
        assert_eq!(cfg.active, 1);
        assert!(cfg.pow2);
    }

    #[test]
    fn tx_q_rr_cycles_only_set_bits() {
        let mut inner = VmSideInner::uninit();
        inner.max_qp = 4;
        inner.tx_q_bitmap = 0b1010; // queues 1 and 3
        inner.tx_q_rr = 1;
        assert_eq!(inner.advance_tx_q_rr(), Some(3));
        assert_eq!(inner.advance_tx_q_rr(), Some(1));
    }

    #[test]
    fn migrate_mempool_swaps_pool_and_node() {
        let relay = Relay::new(0, Mempool::new(0, 2048), 0, false);
        assert_eq!(relay.mempool_node(), 0);
        let old = relay.migrate_mempool(Mempool::new(1, 2048), 1);
        assert_eq!(old.node(), 0);
        assert_eq!(relay.mempool_node(), 1);
        assert_eq!(relay.mempool().node(), 1);
    }

    #[test]
    fn cache_drain_reports_count_and_empties() {
        let mempool = Mempool::new(0, 2048);
        let mut vm = VmSideInner::uninit();
        vm.cached_pkts.push(mempool.alloc(64));
        vm.cached_pkts.push(mempool.alloc(64));
        assert_eq!(vm.drain_cache(), 2);
        assert!(vm.cached_pkts.is_empty());
        assert_eq!(mempool.outstanding(), 0);
    }

    #[test]
    fn relay_is_operational_only_when_both_sides_ready() {
        let relay = Relay::new(0, Mempool::new(0, 2048), 0, false);
        assert!(!relay.is_operational());
        relay.vm.state.set(VmState::Ready);
        assert!(!relay.is_operational());
        relay.nic.state.set(NicState::Ready);
        assert!(relay.is_operational());
    }
}
