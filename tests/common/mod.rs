//! In-memory `PortDriver`/`VhostDev` stand-ins for exercising the
//! forwarding paths and the engine's control-plane surface without a real
//! NIC or guest.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use vio_relay::error::Result;
use vio_relay::mempool::{Mempool, Packet};
use vio_relay::pmd::{PortDriver, PortId};
use vio_relay::topology::NodeId;
use vio_relay::vhost_dev::VhostDev;

#[derive(Default)]
struct FakePort {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
    running: bool,
}

/// A `PortDriver` whose "wire" is an in-process queue per attached port.
pub struct FakePortDriver {
    next_id: AtomicU32,
    ports: Mutex<HashMap<PortId, FakePort>>,
}

impl FakePortDriver {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn push_rx(&self, port: PortId, frame: Vec<u8>) {
        self.ports.lock().unwrap().get_mut(&port).unwrap().rx.push_back(frame);
    }

    pub fn take_tx(&self, port: PortId) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.ports.lock().unwrap().get_mut(&port).unwrap().tx)
    }
}

impl Default for FakePortDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDriver for FakePortDriver {
    fn attach(&self, _name: &str) -> Result<PortId> {
        let id = PortId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.ports.lock().unwrap().insert(id, FakePort::default());
        Ok(id)
    }

    fn detach(&self, port: PortId) {
        self.ports.lock().unwrap().remove(&port);
    }

    fn configure_queues(&self, _port: PortId, _mempool: &Mempool) -> Result<()> {
        Ok(())
    }

    fn start(&self, port: PortId) -> Result<()> {
        self.ports.lock().unwrap().get_mut(&port).unwrap().running = true;
        Ok(())
    }

    fn stop(&self, port: PortId) -> Result<()> {
        self.ports.lock().unwrap().get_mut(&port).unwrap().running = false;
        Ok(())
    }

    fn rx_burst(&self, port: PortId, _queue: u16, max: usize, mempool: &Mempool) -> Vec<Packet> {
        let mut ports = self.ports.lock().unwrap();
        let state = ports.get_mut(&port).unwrap();
        if !state.running {
            return Vec::new();
        }
        let mut out = Vec::new();
        for _ in 0..max {
            match state.rx.pop_front() {
                Some(bytes) => out.push(Packet::from_bytes(mempool, &bytes)),
                None => break,
            }
        }
        out
    }

    fn tx_burst(&self, port: PortId, _queue: u16, pkts: &mut Vec<Packet>) -> (usize, u64) {
        let mut ports = self.ports.lock().unwrap();
        let state = ports.get_mut(&port).unwrap();
        if !state.running {
            return (0, 0);
        }
        let mut sent = 0usize;
        let mut bytes = 0u64;
        while !pkts.is_empty() {
            let pkt = pkts.remove(0);
            bytes += pkt.len() as u64;
            state.tx.push(pkt.as_slice().to_vec());
            sent += 1;
        }
        (sent, bytes)
    }
}

/// A `VhostDev` whose guest rings are in-process queues. Queue `2*qp` is
/// the guest rx ring (host enqueues), `2*qp + 1` is the guest tx ring (host
/// dequeues), matching the production convention.
pub struct FakeVhostDev {
    queues: Vec<Mutex<VecDeque<Vec<u8>>>>,
    ring_capacity: Vec<Mutex<usize>>,
    ifname: String,
    numa_node: Option<NodeId>,
}

impl FakeVhostDev {
    pub fn new(queue_pairs: u16, ifname: &str, numa_node: Option<NodeId>) -> Self {
        let n = (queue_pairs.max(1) as usize) * 2;
        Self {
            queues: (0..n).map(|_| Mutex::new(VecDeque::new())).collect(),
            ring_capacity: (0..n).map(|_| Mutex::new(usize::MAX)).collect(),
            ifname: ifname.to_string(),
            numa_node,
        }
    }

    /// Queue a guest tx frame (consumed by `vm_to_nic` via `vhost_dequeue_burst`).
    pub fn push_tx(&self, qp: u16, frame: Vec<u8>) {
        self.queues[(2 * qp + 1) as usize].lock().unwrap().push_back(frame);
    }

    /// Drain whatever the host has enqueued into the guest rx ring so far.
    pub fn drain_rx(&self, queue: u16) -> Vec<Vec<u8>> {
        self.queues[queue as usize].lock().unwrap().drain(..).collect()
    }

    /// Bound how many entries the guest rx ring can hold before
    /// `vhost_enqueue_burst` starts returning a short count.
    pub fn set_rx_ring_capacity(&self, queue: u16, cap: usize) {
        *self.ring_capacity[queue as usize].lock().unwrap() = cap;
    }

}

impl VhostDev for FakeVhostDev {
    fn get_vring_count(&self) -> u16 {
        self.queues.len() as u16
    }

    fn get_ifname(&self) -> String {
        self.ifname.clone()
    }

    fn get_numa_node(&self) -> Option<NodeId> {
        self.numa_node
    }

    fn enable_notification(&self, _queue: u16, _enable: bool) {}

    fn avail_entries(&self, queue: u16) -> usize {
        let cap = *self.ring_capacity[queue as usize].lock().unwrap();
        let used = self.queues[queue as usize].lock().unwrap().len();
        cap.saturating_sub(used)
    }

    fn vhost_dequeue_burst(&self, queue: u16, mempool: &Mempool, max: usize) -> Vec<Packet> {
        let mut q = self.queues[queue as usize].lock().unwrap();
        let mut out = Vec::new();
        for _ in 0..max {
            match q.pop_front() {
                Some(bytes) => out.push(Packet::from_bytes(mempool, &bytes)),
                None => break,
            }
        }
        out
    }

    fn vhost_enqueue_burst(&self, queue: u16, pkts: &mut Vec<Packet>) -> usize {
        let cap = *self.ring_capacity[queue as usize].lock().unwrap();
        let mut q = self.queues[queue as usize].lock().unwrap();
        let mut sent = 0usize;
        while !pkts.is_empty() && q.len() < cap {
            let pkt = pkts.remove(0);
            q.push_back(pkt.as_slice().to_vec());
            sent += 1;
        }
        sent
    }
}

/// A minimal, valid Ethernet/IPv4/UDP frame carrying `payload_tag` in its
/// last two bytes, for ordering assertions. `(src, dst)` select the flow.
pub fn udp_frame(src: u32, dst: u32, sport: u16, dport: u16, payload_tag: u16) -> Vec<u8> {
    let mut f = vec![0u8; 42];
    f[12] = 0x08;
    f[13] = 0x00;
    f[14] = 0x45; // version 4, IHL 5 words
    f[23] = 17; // UDP
    f[26..30].copy_from_slice(&src.to_be_bytes());
    f[30..34].copy_from_slice(&dst.to_be_bytes());
    f[34..36].copy_from_slice(&sport.to_be_bytes());
    f[36..38].copy_from_slice(&dport.to_be_bytes());
    f[40..42].copy_from_slice(&payload_tag.to_be_bytes());
    f
}
