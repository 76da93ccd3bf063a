//! The two forwarding paths (§4.2, §4.3).
//!
//! Both functions are called once per worker tick, each under a
//! successful try-lock of its own side; cross-side reads (the opposite
//! side's attachment state, device handle, and — for RSS — the vm-side's
//! queue steering table) go through the lock-free fields on
//! [`crate::relay::VmSide`]/[`crate::relay::NicSide`], never through the
//! opposite side's try-lock, matching §5's "no contention between two
//! workers except across direction migration".

use tracing::{debug, trace};

use crate::constants::{BURST_LEN, VIRTIO_RXQ};
use crate::relay::{NicState, Relay, VmState};
use crate::rss::{self, FlowKey};

/// Runs one vm→nic tick for `relay`. Returns whether any packet was
/// dequeued, transmitted, or dropped (the worker's `processed` signal).
pub fn vm_to_nic(relay: &Relay) -> bool {
    let Some(mut vm) = relay.vm.lock.try_lock() else {
        return false;
    };
    let vm_state = relay.vm.state.get();
    let nic_state = relay.nic.state.get();
    let mut processed = false;

    if vm.cached_pkts.is_empty() && vm_state == VmState::Ready {
        if let Some(dev) = relay.vm.dev.load_full() {
            if let Some(q) = vm.advance_tx_q_rr() {
                let mempool = relay.mempool();
                let pkts = dev.vhost_dequeue_burst(2 * q + 1, &mempool, BURST_LEN);
                if !pkts.is_empty() {
                    let bytes: u64 = pkts.iter().map(|p| p.len() as u64).sum();
                    relay.counters.vm_to_nic.record_rx(pkts.len() as u64, bytes);
                    vm.cached_pkts.extend(pkts);
                    processed = true;
                }
            }
        }
    }

    if nic_state == NicState::Ready {
        if let Some(port) = relay.nic.port.load_full() {
            if !vm.cached_pkts.is_empty() {
                let (sent, bytes) = port.driver.tx_burst(port.id, 0, &mut vm.cached_pkts);
                if sent > 0 {
                    relay.counters.vm_to_nic.record_tx(sent as u64, bytes);
                    processed = true;
                }
                if !vm.cached_pkts.is_empty() {
                    relay
                        .counters
                        .vm_to_nic
                        .record_drop_full(vm.cached_pkts.len() as u64);
                }
            }
        }
    } else if !vm.cached_pkts.is_empty() {
        let dropped = vm.drain_cache();
        relay.counters.vm_to_nic.record_drop_unavail(dropped as u64);
        processed = true;
        trace!(relay = relay.id, dropped, "vm_to_nic: nic side unavailable, cache dropped");
    }

    if vm_state == VmState::Removing1 {
        let next = if relay.nic.cpu.get().is_none() {
            VmState::Uninit
        } else {
            VmState::Removing2
        };
        relay.vm.state.set(next);
        debug!(relay = relay.id, ?next, "vm_to_nic: vm side advancing removal");
        processed = true;
    }

    if nic_state == NicState::Removing2 {
        if let Some(mut nic) = relay.nic.lock.try_lock() {
            let dropped = nic.drain_cache();
            relay.nic.state.set(NicState::Uninit);
            nic.slaves.clear();
            nic.port = None;
            debug!(relay = relay.id, dropped, "vm_to_nic: nic side final drain");
            processed = true;
        }
    }

    processed
}

/// Runs one nic→vm tick for `relay`. Returns whether any packet was
/// dequeued, enqueued, or dropped.
pub fn nic_to_vm(relay: &Relay) -> bool {
    let Some(mut nic) = relay.nic.lock.try_lock() else {
        return false;
    };
    let vm_state = relay.vm.state.get();
    let nic_state = relay.nic.state.get();
    let mut processed = false;

    if nic.cached_pkts.is_empty() {
        if let (Some(port), Some(dev)) = (relay.nic.port.load_full(), relay.vm.dev.load_full()) {
            let avail = dev.avail_entries(VIRTIO_RXQ);
            let want = BURST_LEN.min(avail);
            let mempool = relay.mempool();
            let pkts = port.driver.rx_burst(port.id, 0, want, &mempool);
            if !pkts.is_empty() {
                let bytes: u64 = pkts.iter().map(|p| p.len() as u64).sum();
                relay.counters.nic_to_vm.record_rx(pkts.len() as u64, bytes);
                nic.cached_pkts.extend(pkts);
                processed = true;
            }
        }
    }

    if vm_state == VmState::Ready && !nic.cached_pkts.is_empty() {
        if let Some(dev) = relay.vm.dev.load_full() {
            let rx_queues = relay.vm.rx_queues.load_full();
            if rx_queues.active > 1 {
                processed |= enqueue_with_rss(relay, dev.as_ref(), &mut nic.cached_pkts, &rx_queues);
            } else {
                let sent = dev.vhost_enqueue_burst(2 * VIRTIO_RXQ, &mut nic.cached_pkts);
                if sent > 0 {
                    let bytes_sent = sent as u64; // per-packet byte accounting happened at dequeue time
                    relay.counters.nic_to_vm.record_tx(sent as u64, bytes_sent);
                    processed = true;
                }
            }
        }
    }

    if vm_state != VmState::Ready && !nic.cached_pkts.is_empty() {
        let dropped = nic.drain_cache();
        relay.counters.nic_to_vm.record_drop_unavail(dropped as u64);
        processed = true;
        trace!(relay = relay.id, dropped, "nic_to_vm: vm side unavailable, cache dropped");
    }

    if vm_state == VmState::Removing2 {
        relay.vm.dev.store(None);
        relay.vm.state.set(VmState::Uninit);
        debug!(relay = relay.id, "nic_to_vm: vm side removal complete");
        processed = true;
    }

    if nic_state == NicState::Removing1 {
        if relay.vm.cpu.get().is_none() {
            // No vm-side worker will ever run the Removing2 drain (§4.1's
            // intermediate state only exists for the opposite direction to
            // free its cache), so perform the final drain here instead of
            // skipping straight to `UNINIT` with the port still attached.
            let dropped = nic.drain_cache();
            nic.slaves.clear();
            nic.port = None;
            relay.nic.state.set(NicState::Uninit);
            debug!(relay = relay.id, dropped, "nic_to_vm: nic side final drain (no vm worker)");
        } else {
            relay.nic.state.set(NicState::Removing2);
            debug!(relay = relay.id, "nic_to_vm: nic side advancing removal");
        }
        processed = true;
    }

    processed
}

/// Multi-queue nic→vm enqueue (§4.3 step 2). Batches contiguous runs of
/// packets that hash to the same guest queue into one vhost-enqueue call
/// each; a short enqueue aborts the run, leaving the remainder (including
/// anything after it in `pkts`) for the next tick.
fn enqueue_with_rss(
    relay: &Relay,
    dev: &dyn crate::vhost_dev::VhostDev,
    pkts: &mut Vec<crate::mempool::Packet>,
    rx_queues: &crate::relay::RxQueueConfig,
) -> bool {
    let mut processed = false;
    let mut i = 0usize;

    while i < pkts.len() {
        let target_queue = classify_queue(pkts[i].as_slice(), rx_queues);
        let mut run_len = 1usize;
        while i + run_len < pkts.len()
            && classify_queue(pkts[i + run_len].as_slice(), rx_queues) == target_queue
        {
            run_len += 1;
        }

        let mut run: Vec<_> = pkts.drain(i..i + run_len).collect();
        let sent = dev.vhost_enqueue_burst(2 * target_queue, &mut run);
        if sent > 0 {
            relay.counters.nic_to_vm.record_tx(sent as u64, sent as u64);
            processed = true;
        }
        if !run.is_empty() {
            // Short enqueue: stop this tick, put the remainder (and
            // everything not yet processed) back for a retry.
            let mut rest = run;
            rest.extend(pkts.drain(i..));
            *pkts = rest;
            return processed;
        }
        // `run` fully drained; `i` stays put since `drain` shifted later
        // elements down to index `i`.
    }

    processed
}

fn classify_queue(frame: &[u8], rx_queues: &crate::relay::RxQueueConfig) -> u16 {
    let key = parse_flow_key(frame);
    let hash = rss::hash_flow(&key);
    let slot = rss::reduce(hash, rx_queues.active, rx_queues.pow2);
    rx_queues.lut[slot as usize]
}

fn parse_flow_key(frame: &[u8]) -> FlowKey<'_> {
    if frame.len() < 14 {
        return FlowKey::Other {
            l2_prefix: frame,
            ethertype: 0,
        };
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    match ethertype {
        0x0800 if frame.len() >= 34 => {
            let ihl = (frame[14] & 0x0f) as usize * 4;
            let proto = frame[23];
            let src_ip = u32::from_be_bytes(frame[26..30].try_into().unwrap());
            let dst_ip = u32::from_be_bytes(frame[30..34].try_into().unwrap());
            let l4_off = 14 + ihl;
            let ports = if matches!(proto, 6 | 17 | 132) && frame.len() >= l4_off + 4 {
                let sport = u16::from_be_bytes(frame[l4_off..l4_off + 2].try_into().unwrap());
                let dport = u16::from_be_bytes(frame[l4_off + 2..l4_off + 4].try_into().unwrap());
                Some(((dport as u32) << 16) | sport as u32)
            } else {
                None
            };
            FlowKey::Ipv4 { src_ip, dst_ip, proto, ports }
        }
        0x86DD if frame.len() >= 54 => {
            let next_header = frame[20];
            let mut src_addr = [0u32; 4];
            let mut dst_addr = [0u32; 4];
            for i in 0..4 {
                src_addr[i] = u32::from_be_bytes(frame[22 + i * 4..26 + i * 4].try_into().unwrap());
                dst_addr[i] = u32::from_be_bytes(frame[38 + i * 4..42 + i * 4].try_into().unwrap());
            }
            FlowKey::Ipv6 { src_addr, dst_addr, next_header }
        }
        _ => FlowKey::Other {
            l2_prefix: &frame[0..12],
            ethertype,
        },
    }
}
