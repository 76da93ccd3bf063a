//! Packet buffer pool (§4.6 "Mempool manager").
//!
//! Mirrors `pktmbuf_pool_create`/`pool_free` from the underlying
//! poll-mode-driver interface (§6): a pool is bound to a NUMA node and a
//! buffer geometry, and hands out owned buffers whose release is tracked
//! so invariant 7 (no double free, no leak) can be checked exactly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::topology::NodeId;

struct MempoolInner {
    node: NodeId,
    buffer_size: usize,
    allocated: AtomicU64,
    freed: AtomicU64,
}

/// A packet buffer pool bound to one NUMA node.
#[derive(Clone)]
pub struct Mempool {
    inner: Arc<MempoolInner>,
}

impl Mempool {
    pub fn new(node: NodeId, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(MempoolInner {
                node,
                buffer_size,
                allocated: AtomicU64::new(0),
                freed: AtomicU64::new(0),
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Allocate an owned, zero-initialized buffer of `len` bytes (<=
    /// `buffer_size`). Released automatically when the returned `Packet`
    /// is dropped — there is no way to free it twice.
    pub fn alloc(&self, len: usize) -> Packet {
        debug_assert!(len <= self.inner.buffer_size);
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        Packet {
            pool: self.inner.clone(),
            data: vec![0u8; len],
        }
    }

    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.inner.freed.load(Ordering::Relaxed)
    }

    /// Buffers checked out but not yet returned. Must be zero once a relay
    /// is fully torn down (invariant 7).
    pub fn outstanding(&self) -> u64 {
        self.allocated().saturating_sub(self.freed())
    }
}

/// An owned packet buffer checked out of a [`Mempool`].
pub struct Packet {
    pool: Arc<MempoolInner>,
    data: Vec<u8>,
}

impl Packet {
    pub fn from_bytes(pool: &Mempool, bytes: &[u8]) -> Self {
        pool.inner.allocated.fetch_add(1, Ordering::Relaxed);
        Packet {
            pool: pool.inner.clone(),
            data: bytes.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.pool.freed.fetch_add(1, Ordering::Relaxed);
    }
}
