//! Per-relay packet counters and rate computation.
//!
//! Six monotonic u64 counters per direction (§3). Counters are
//! single-writer per field — only the worker that owns a direction's lock
//! ever increments that direction's counters — so each field is an
//! `AtomicU64` written with `Relaxed` ordering purely to avoid torn
//! reads, not to synchronize with anything. This keeps the fast path
//! lock-free for stats even though §5 allows a conventional mutex for the
//! control-plane-only rate query below.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A point-in-time, non-atomic copy of one direction's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirCounters {
    pub packets: u64,
    pub bytes: u64,
    pub drop_full: u64,
    pub drop_unavail: u64,
    pub tx: u64,
    pub rx: u64,
}

impl DirCounters {
    fn delta(&self, snapshot: &DirCounters) -> DirCounters {
        DirCounters {
            packets: self.packets.wrapping_sub(snapshot.packets),
            bytes: self.bytes.wrapping_sub(snapshot.bytes),
            drop_full: self.drop_full.wrapping_sub(snapshot.drop_full),
            drop_unavail: self.drop_unavail.wrapping_sub(snapshot.drop_unavail),
            tx: self.tx.wrapping_sub(snapshot.tx),
            rx: self.rx.wrapping_sub(snapshot.rx),
        }
    }
}

/// Live, lock-free counters for one direction. Embedded directly in
/// `VmSide` (vm→nic) and `NicSide` (nic→vm) so the only synchronization
/// the fast path pays for is the per-side try-lock, not a second lock for
/// stats.
#[derive(Debug, Default)]
pub struct AtomicDirCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    drop_full: AtomicU64,
    drop_unavail: AtomicU64,
    tx: AtomicU64,
    rx: AtomicU64,
}

impl AtomicDirCounters {
    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.rx.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.tx.fetch_add(packets, Ordering::Relaxed);
        let _ = bytes;
    }

    pub fn record_drop_full(&self, n: u64) {
        self.drop_full.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_drop_unavail(&self, n: u64) {
        self.drop_unavail.fetch_add(n, Ordering::Relaxed);
    }

    pub fn load(&self) -> DirCounters {
        DirCounters {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            drop_full: self.drop_full.load(Ordering::Relaxed),
            drop_unavail: self.drop_unavail.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            rx: self.rx.load(Ordering::Relaxed),
        }
    }
}

/// Rates (units/second) for one direction, computed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirRates {
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RelayRates {
    pub vm_to_nic: DirRates,
    pub nic_to_vm: DirRates,
}

struct RateTrackerInner {
    snapshot_vm_to_nic: DirCounters,
    snapshot_nic_to_vm: DirCounters,
    snapshot_at: Instant,
}

/// `get_stats`/`reset_rate_stats` support (§4.10). Control-plane-only: the
/// mutex here never contends with a worker, since workers only ever touch
/// the `AtomicDirCounters` they own.
pub struct RateTracker {
    inner: Mutex<RateTrackerInner>,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            inner: Mutex::new(RateTrackerInner {
                snapshot_vm_to_nic: DirCounters::default(),
                snapshot_nic_to_vm: DirCounters::default(),
                snapshot_at: now,
            }),
        }
    }

    /// Rate query: computes `(current - snapshot) / elapsed` for both
    /// directions and *resets* the snapshot as a side effect, matching the
    /// source's semantics even when the caller discards the result.
    pub fn compute_and_reset_rates(
        &self,
        vm_to_nic: &AtomicDirCounters,
        nic_to_vm: &AtomicDirCounters,
        now: Instant,
    ) -> RelayRates {
        let mut inner = self.inner.lock().unwrap();
        let elapsed = now.saturating_duration_since(inner.snapshot_at).as_secs_f64();
        let elapsed = if elapsed > 0.0 { elapsed } else { 1.0 };

        let cur_vm = vm_to_nic.load();
        let cur_nic = nic_to_vm.load();
        let d_vm = cur_vm.delta(&inner.snapshot_vm_to_nic);
        let d_nic = cur_nic.delta(&inner.snapshot_nic_to_vm);

        let rates = RelayRates {
            vm_to_nic: DirRates {
                packets_per_sec: d_vm.packets as f64 / elapsed,
                bytes_per_sec: d_vm.bytes as f64 / elapsed,
            },
            nic_to_vm: DirRates {
                packets_per_sec: d_nic.packets as f64 / elapsed,
                bytes_per_sec: d_nic.bytes as f64 / elapsed,
            },
        };

        inner.snapshot_vm_to_nic = cur_vm;
        inner.snapshot_nic_to_vm = cur_nic;
        inner.snapshot_at = now;

        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_query_resets_snapshot_as_side_effect() {
        let vm = AtomicDirCounters::default();
        let nic = AtomicDirCounters::default();
        vm.record_rx(1000, 64_000);

        let t0 = Instant::now();
        let tracker = RateTracker::new(t0);

        let t1 = t0 + Duration::from_secs(1);
        let rates = tracker.compute_and_reset_rates(&vm, &nic, t1);
        assert!((rates.vm_to_nic.packets_per_sec - 1000.0).abs() < 1e-6);

        // Discard the result of a second call entirely; the snapshot must
        // still have moved, so a third call only sees the new delta.
        vm.record_rx(500, 32_000);
        let _ = tracker.compute_and_reset_rates(&vm, &nic, t1 + Duration::from_secs(1));

        let t2 = t1 + Duration::from_secs(2);
        let rates2 = tracker.compute_and_reset_rates(&vm, &nic, t2);
        assert!((rates2.vm_to_nic.packets_per_sec - 0.0).abs() < 1e-6);
    }

    #[test]
    fn load_has_no_side_effects() {
        let vm = AtomicDirCounters::default();
        vm.record_rx(42, 1000);
        assert_eq!(vm.load().packets, 42);
        assert_eq!(vm.load().packets, 42);
    }
}
