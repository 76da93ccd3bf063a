//! Fixed sizes named throughout §2-§4.

/// Upper bound on concurrently configured relays in one process.
pub const N_RELAYS: usize = 64;

/// Upper bound on queue pairs per guest (`rx_q_lut` capacity).
pub const MAX_QP: usize = 32;

/// Packets processed together in one forwarding-path call.
pub const BURST_LEN: usize = 32;

/// Upper bound on VFs behind one bond.
pub const MAX_SLAVES: usize = 8;

/// Single-queue nic→vm destination when RSS is not in play.
pub const VIRTIO_RXQ: u16 = 0;

/// RSS seed (Design Notes: "wire compatibility... with existing deployments").
pub const RSS_JHASH_SEED: u32 = 0xdeadbee5;

/// Scheduling-policy load weights (§4.5).
pub const VM_TO_NIC_WEIGHT: u32 = 10;
pub const NIC_TO_VM_WEIGHT: u32 = 12;

/// Cooperative-removal poll cadence (§5): 50ms × 20 ≈ 1s.
pub const REMOVAL_POLL_INTERVAL_MS: u64 = 50;
pub const REMOVAL_POLL_ATTEMPTS: u32 = 20;

/// Worker back-off after a fully idle pass (§4.4, §5).
pub const WORKER_IDLE_BACKOFF_MS: u64 = 1;

/// Default per-buffer size for a relay's mempool (§4.6).
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Buffer size when the jumbo/MTU toggle is set (ambient CLI surface, §6).
pub const JUMBO_BUFFER_SIZE: usize = 9018;
