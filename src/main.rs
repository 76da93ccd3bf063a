//! Reference binary: parses the CLI surface, builds an `Engine`, attaches
//! any statically configured VFs, and blocks until asked to shut down
//! (§6: "Exit code 0 on clean shutdown; non-zero on initialization
//! failure"). The fast path this binary drives starts no async runtime;
//! shutdown is a plain signal-driven flag, not a `tokio` select.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{error, info, warn};

use vio_relay::config::{Cli, EngineConfig};
use vio_relay::engine::Engine;
use vio_relay::pmd::softnic::SoftPortDriver;
use vio_relay::topology::SingleNodeTopology;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Release);
}

fn install_signal_handlers() -> anyhow::Result<()> {
    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(request_shutdown))?;
        signal(Signal::SIGTERM, SigHandler::Handler(request_shutdown))?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config: EngineConfig = cli.into();

    if let Err(e) = install_signal_handlers() {
        error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    let topology = Arc::new(SingleNodeTopology::new(config.worker_cores.iter().copied()));
    let port_driver = Arc::new(SoftPortDriver::new());
    let engine = Engine::new(&config, topology, port_driver);

    for (id, pci_addr) in config.static_vfs.iter().enumerate() {
        match engine.add_vf(pci_addr, id as u32, false) {
            Ok(_) => info!(relay = id, pci_addr, "static vf attached"),
            Err(e) => warn!(relay = id, pci_addr, error = %e, "static vf attach failed"),
        }
    }

    info!(cores = ?config.worker_cores, "engine running, waiting for shutdown signal");
    while !SHUTDOWN.load(Ordering::Acquire) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("shutdown signal received, draining workers");
    engine.shutdown();
    info!("engine stopped");
}
