//! Engine configuration and the CLI surface that builds it (§6, ambient).
//!
//! `EngineConfig` is plain data; the engine crate depends on `clap` only
//! through `Cli`, kept in this module so the core itself stays decoupled
//! from argument parsing (§1 ambient-stack note).

use clap::Parser;

use crate::topology::CoreId;

/// Configuration consumed by [`crate::engine::Engine::new`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The worker-core-bitmap: one pinned worker per entry (§2, §4.4).
    pub worker_cores: Vec<CoreId>,
    /// Reserved for the control thread; not otherwise consumed by the
    /// engine itself (§6: "master-core" is informational CLI surface).
    pub master_core: Option<CoreId>,
    /// Base path for the vhost-user listen socket(s).
    pub vhost_socket_path: String,
    /// `{}`-style template used to derive a per-relay socket name from the
    /// base path, e.g. `relay{}.sock`.
    pub vhost_socket_name_template: String,
    /// PCI addresses to `add_vf` automatically at startup, one relay id
    /// per position starting at 0.
    pub static_vfs: Vec<String>,
    /// Jumbo/MTU toggle: selects `JUMBO_BUFFER_SIZE` over
    /// `DEFAULT_BUFFER_SIZE` for every relay's mempool.
    pub jumbo: bool,
    /// When set, the binary treats a NUMA-node mismatch on `add_virtio` as
    /// a hard refusal rather than letting the engine migrate the mempool.
    pub numa_restricted: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_cores: vec![0],
            master_core: None,
            vhost_socket_path: "/tmp/vio-relay".to_string(),
            vhost_socket_name_template: "relay{}.sock".to_string(),
            static_vfs: Vec::new(),
            jumbo: false,
            numa_restricted: false,
        }
    }
}

/// Command-line surface (§6 "CLI surface"): core-bitmap, master-core,
/// vhost socket path/name template, optional static VF list, jumbo/MTU
/// toggle, NUMA-restriction toggle, version.
#[derive(Debug, Parser)]
#[command(name = "vio-relay", version, about = "virtio<->NIC packet relay")]
pub struct Cli {
    /// Comma-separated list of CPU core ids to run a pinned worker on.
    #[arg(long, value_delimiter = ',', required = true)]
    pub core_bitmap: Vec<CoreId>,

    /// CPU core id reserved for the control thread (informational).
    #[arg(long)]
    pub master_core: Option<CoreId>,

    /// Base path for the vhost-user listen socket(s).
    #[arg(long, default_value = "/tmp/vio-relay")]
    pub vhost_socket_path: String,

    /// `{}`-style template for deriving a per-relay socket name.
    #[arg(long, default_value = "relay{}.sock")]
    pub vhost_socket_name_template: String,

    /// Comma-separated PCI addresses to attach at startup, one per relay
    /// id starting at 0.
    #[arg(long, value_delimiter = ',')]
    pub static_vf: Vec<String>,

    /// Use jumbo-sized packet buffers.
    #[arg(long)]
    pub jumbo: bool,

    /// Refuse cross-NUMA-node mempool migration instead of performing it.
    #[arg(long)]
    pub numa_restricted: bool,
}

impl From<Cli> for EngineConfig {
    fn from(cli: Cli) -> Self {
        Self {
            worker_cores: cli.core_bitmap,
            master_core: cli.master_core,
            vhost_socket_path: cli.vhost_socket_path,
            vhost_socket_name_template: cli.vhost_socket_name_template,
            static_vfs: cli.static_vf,
            jumbo: cli.jumbo,
            numa_restricted: cli.numa_restricted,
        }
    }
}
