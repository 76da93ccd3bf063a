//! Worker pool (§2 point 2, §4.4).
//!
//! One OS thread per configured core, pinned with `core_affinity`. Each
//! worker owns an `active_relays` bitmap rebuilt from the engine's relay
//! table whenever `update_needed` is raised, and polls the bits it owns
//! in ascending id order every tick (§4.4's loop, verbatim).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::constants::WORKER_IDLE_BACKOFF_MS;
use crate::forward;
use crate::relay::Relay;
use crate::topology::CoreId;

/// Per-core scheduling state. `active_relays`/`update_needed` are the only
/// fields a control-plane thread touches directly; everything else is
/// worker-thread-only (§5: "Worker `active_relays` is written by the
/// worker only; control code signals change by raising `update_needed`").
pub struct Worker {
    pub core_id: CoreId,
    active_relays: AtomicU64,
    update_needed: AtomicBool,
    must_stop: AtomicBool,
    running: AtomicBool,
}

impl Worker {
    pub fn new(core_id: CoreId) -> Arc<Self> {
        Arc::new(Self {
            core_id,
            active_relays: AtomicU64::new(0),
            update_needed: AtomicBool::new(true),
            must_stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    /// Raised by control-plane code any time a field this worker consults
    /// (side state, cpu assignment, queue bitmaps) changes on any relay.
    pub fn raise_update_needed(&self) {
        self.update_needed.store(true, Ordering::Release);
    }

    pub fn active_relays(&self) -> u64 {
        self.active_relays.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.must_stop.store(true, Ordering::Release);
    }

    fn rebuild_active_relays(&self, relays: &[Relay]) {
        let mut bitmap = 0u64;
        for (idx, relay) in relays.iter().enumerate().take(64) {
            let owns_vm = relay.vm.cpu.get() == Some(self.core_id)
                && relay.vm.state.get() != crate::relay::VmState::Uninit;
            let owns_nic = relay.nic.cpu.get() == Some(self.core_id)
                && relay.nic.state.get() != crate::relay::NicState::Uninit;
            if owns_vm || owns_nic {
                bitmap |= 1u64 << idx;
            }
        }
        self.active_relays.store(bitmap, Ordering::Release);
    }

    /// One full pass over `active_relays` (§4.4's loop body). Returns
    /// whether any relay made progress, driving the idle back-off.
    fn tick(&self, relays: &[Relay]) -> bool {
        if self.update_needed.swap(false, Ordering::AcqRel) {
            self.rebuild_active_relays(relays);
        }

        let mut processed = false;
        let bitmap = self.active_relays();
        let mut remaining = bitmap;
        while remaining != 0 {
            let idx = remaining.trailing_zeros() as usize;
            remaining &= remaining - 1;
            let Some(relay) = relays.get(idx) else {
                continue;
            };

            if relay.vm.cpu.get() == Some(self.core_id) {
                processed |= forward::vm_to_nic(relay);
            }
            if relay.nic.cpu.get() == Some(self.core_id) {
                processed |= forward::nic_to_vm(relay);
            }
        }
        processed
    }

    /// Runs the worker loop on the calling thread until `must_stop` is
    /// observed. Intended to be the body of the worker's dedicated OS
    /// thread (see [`spawn`]).
    pub fn run(self: &Arc<Self>, relays: Arc<Vec<Relay>>) {
        self.running.store(true, Ordering::Release);
        debug!(core = self.core_id, "worker starting");
        while !self.must_stop.load(Ordering::Acquire) {
            let processed = self.tick(&relays);
            if !processed {
                std::thread::sleep(Duration::from_millis(WORKER_IDLE_BACKOFF_MS));
            }
        }
        self.running.store(false, Ordering::Release);
        debug!(core = self.core_id, "worker stopped");
    }
}

/// Spawns a dedicated, core-pinned OS thread running `worker`'s loop.
pub fn spawn(worker: Arc<Worker>, relays: Arc<Vec<Relay>>) -> JoinHandle<()> {
    let core_id = worker.core_id;
    std::thread::Builder::new()
        .name(format!("relay-worker-{core_id}"))
        .spawn(move || {
            let id = core_affinity::CoreId { id: core_id as usize };
            if !core_affinity::set_for_current(id) {
                info!(core = core_id, "failed to pin worker thread to core");
            }
            worker.run(relays);
        })
        .expect("failed to spawn worker thread")
}
