//! Typed interface over the guest-facing virtio queue pair (§6 "per-guest
//! primitives"). The vhost-user handshake itself (socket accept, feature
//! negotiation, memory table setup) is a control-plane concern this crate
//! does not implement (§1); by the time `add_virtio` hands a `VhostDev` to
//! the engine, that handshake has already produced live `VringRwLock`s
//! over shared guest memory, with `update_memory`/`set_vring_*` already
//! having run.

use std::sync::RwLock;

use vhost_user_backend::{VringRwLock, VringT};
use virtio_queue::QueueT;
use vm_memory::{Address, ByteValued, Bytes, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap, Le16};

use crate::mempool::{Mempool, Packet};
use crate::topology::NodeId;

/// Virtio-net header, without mergeable rx buffers.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtioNetHdr {
    pub flags: u8,
    pub gso_type: u8,
    pub hdr_len: Le16,
    pub gso_size: Le16,
    pub csum_start: Le16,
    pub csum_offset: Le16,
    pub num_buffers: Le16,
}

unsafe impl ByteValued for VirtioNetHdr {}

pub const VIRTIO_NET_HDR_SIZE: usize = 12;

/// Per-guest queue-pair operations the forwarding paths consume.
///
/// Queue numbering follows the virtio-net convention: queue `2*qp` is the
/// guest's rx ring (host enqueues into it), queue `2*qp + 1` is the
/// guest's tx ring (host dequeues from it) — matching §4.2's "queue
/// `2*tx_q_rr + 1`".
pub trait VhostDev: Send + Sync {
    fn get_vring_count(&self) -> u16;
    fn get_ifname(&self) -> String;
    fn get_numa_node(&self) -> Option<NodeId>;
    fn enable_notification(&self, queue: u16, enable: bool);
    fn avail_entries(&self, queue: u16) -> usize;
    fn vhost_dequeue_burst(&self, queue: u16, mempool: &Mempool, max: usize) -> Vec<Packet>;
    fn vhost_enqueue_burst(&self, queue: u16, pkts: &mut Vec<Packet>) -> usize;
}

/// Reference `VhostDev` backed by real vhost-user vrings over shared guest
/// memory.
pub struct VirtioRingDev {
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
    vrings: Vec<VringRwLock>,
    ifname: String,
    numa_node: Option<NodeId>,
    event_idx: RwLock<bool>,
}

impl VirtioRingDev {
    pub fn new(
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
        vrings: Vec<VringRwLock>,
        ifname: String,
        numa_node: Option<NodeId>,
    ) -> Self {
        Self {
            mem,
            vrings,
            ifname,
            numa_node,
            event_idx: RwLock::new(false),
        }
    }
}

impl VhostDev for VirtioRingDev {
    fn get_vring_count(&self) -> u16 {
        self.vrings.len() as u16
    }

    fn get_ifname(&self) -> String {
        self.ifname.clone()
    }

    fn get_numa_node(&self) -> Option<NodeId> {
        self.numa_node
    }

    fn enable_notification(&self, queue: u16, enable: bool) {
        *self.event_idx.write().unwrap() = enable;
        if let Some(vring) = self.vrings.get(queue as usize) {
            let mem = self.mem.memory();
            let mut state = vring.get_mut();
            let _ = state.get_queue_mut().enable_notification(&*mem);
        }
    }

    fn avail_entries(&self, queue: u16) -> usize {
        let Some(vring) = self.vrings.get(queue as usize) else {
            return 0;
        };
        let mem = self.mem.memory();
        let mut state = vring.get_mut();
        let q = state.get_queue_mut();
        let avail = q.avail_idx(&*mem, std::sync::atomic::Ordering::Acquire);
        match avail {
            Ok(idx) => idx.0.wrapping_sub(q.next_avail()) as usize,
            Err(_) => 0,
        }
    }

    fn vhost_dequeue_burst(&self, queue: u16, mempool: &Mempool, max: usize) -> Vec<Packet> {
        let Some(vring) = self.vrings.get(queue as usize) else {
            return Vec::new();
        };
        let mem = self.mem.memory();
        let mut out = Vec::with_capacity(max.min(32));

        for _ in 0..max {
            let mut state = vring.get_mut();
            let q = state.get_queue_mut();
            let Some(chain) = q.pop_descriptor_chain(mem.clone()) else {
                break;
            };

            let mut pkt = mempool.alloc(mempool.buffer_size());
            let buf = pkt.as_mut_slice();
            let mut offset = 0usize;
            for desc in chain.clone() {
                if !desc.is_write_only() {
                    let len = desc.len() as usize;
                    if offset + len > buf.len() {
                        break;
                    }
                    if mem.read(&mut buf[offset..offset + len], desc.addr()).is_err() {
                        break;
                    }
                    offset += len;
                }
            }
            pkt.truncate(offset);

            let desc_idx = chain.head_index();
            let _ = q.add_used(&*mem, desc_idx, 0);
            let _ = q.enable_notification(&*mem);

            if offset > VIRTIO_NET_HDR_SIZE {
                // Strip the leading virtio-net header: only the Ethernet
                // frame onward is handed to the forwarding path.
                let data = pkt.as_slice()[VIRTIO_NET_HDR_SIZE..].to_vec();
                out.push(Packet::from_bytes(mempool, &data));
            }
        }

        out
    }

    fn vhost_enqueue_burst(&self, queue: u16, pkts: &mut Vec<Packet>) -> usize {
        let Some(vring) = self.vrings.get(queue as usize) else {
            return 0;
        };
        let mem = self.mem.memory();
        let mut sent = 0usize;

        while !pkts.is_empty() {
            let mut state = vring.get_mut();
            let q = state.get_queue_mut();
            let Some(chain) = q.pop_descriptor_chain(mem.clone()) else {
                break;
            };

            let hdr = VirtioNetHdr {
                num_buffers: Le16::from(1),
                ..Default::default()
            };
            let hdr_bytes = hdr.as_slice();
            let packet = &pkts[0];
            let total_len = hdr_bytes.len() + packet.len();

            let mut written = 0usize;
            for desc in chain.clone() {
                if desc.is_write_only() && written < total_len {
                    let to_write = (desc.len() as usize).min(total_len - written);
                    if written < hdr_bytes.len() {
                        let hdr_end = (hdr_bytes.len() - written).min(to_write);
                        if mem.write(&hdr_bytes[written..written + hdr_end], desc.addr()).is_err() {
                            break;
                        }
                        if hdr_end < to_write {
                            let pkt_end = to_write - hdr_end;
                            if mem
                                .write(&packet.as_slice()[..pkt_end], desc.addr().unchecked_add(hdr_end as u64))
                                .is_err()
                            {
                                break;
                            }
                        }
                    } else {
                        let pkt_offset = written - hdr_bytes.len();
                        if mem
                            .write(&packet.as_slice()[pkt_offset..pkt_offset + to_write], desc.addr())
                            .is_err()
                        {
                            break;
                        }
                    }
                    written += to_write;
                }
            }

            let desc_idx = chain.head_index();
            let _ = q.add_used(&*mem, desc_idx, written as u32);
            let _ = q.enable_notification(&*mem);

            pkts.remove(0);
            sent += 1;
        }

        sent
    }
}
