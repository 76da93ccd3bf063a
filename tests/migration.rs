//! Control-plane migration primitives driven through a real `Engine`
//! (with its real pinned worker threads), not just the forwarding
//! functions directly.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakePortDriver, FakeVhostDev};
use vio_relay::config::EngineConfig;
use vio_relay::engine::Engine;
use vio_relay::topology::SingleNodeTopology;
use vio_relay::vhost_dev::VhostDev;

fn test_engine(cores: &[u32]) -> Engine {
    let config = EngineConfig {
        worker_cores: cores.to_vec(),
        ..EngineConfig::default()
    };
    let topology = Arc::new(SingleNodeTopology::new(cores.iter().copied()));
    let port_driver = Arc::new(FakePortDriver::new());
    Engine::new(&config, topology, port_driver)
}

#[test]
fn migrate_cpus_repins_both_sides_and_wakes_the_new_core() {
    let engine = test_engine(&[0, 1, 2, 3]);

    engine.add_vf("eth0", 0, false).unwrap();
    let dev: Arc<dyn VhostDev> = Arc::new(FakeVhostDev::new(1, "vm0", None));
    engine.add_virtio(dev, 0, Some(2), false).unwrap();

    let (vm_cpu, nic_cpu) = engine.cpu_pins(0).unwrap();
    assert_eq!(vm_cpu, Some(2));
    assert!(nic_cpu.is_some());

    engine.migrate_cpus(0, Some(3), Some(1)).unwrap();
    let (vm_cpu, nic_cpu) = engine.cpu_pins(0).unwrap();
    assert_eq!(vm_cpu, Some(3));
    assert_eq!(nic_cpu, Some(1));

    // Give the repinned workers a moment to rebuild their bitmaps and
    // confirm the relay is still operational after the move.
    std::thread::sleep(Duration::from_millis(100));
    let stats = engine.get_stats(0).unwrap();
    assert_eq!(stats.relay_id, 0);

    engine.shutdown();
}

#[test]
fn migrate_cpus_rejects_a_pin_outside_the_worker_bitmap() {
    let engine = test_engine(&[0, 1]);
    engine.add_vf("eth0", 0, false).unwrap();
    let dev: Arc<dyn VhostDev> = Arc::new(FakeVhostDev::new(1, "vm0", None));
    engine.add_virtio(dev, 0, Some(0), false).unwrap();

    assert!(engine.migrate_cpus(0, Some(9), None).is_err());
    let (vm_cpu, _) = engine.cpu_pins(0).unwrap();
    assert_eq!(vm_cpu, Some(0), "a rejected pin must not change the existing assignment");

    engine.shutdown();
}

#[test]
fn add_virtio_migrates_the_mempool_to_the_guest_numa_node() {
    let engine = test_engine(&[0, 1]);
    assert_eq!(engine.mempool_node(0).unwrap(), 0);

    let dev: Arc<dyn VhostDev> = Arc::new(FakeVhostDev::new(1, "vm0", Some(1)));
    engine.add_virtio(dev, 0, None, false).unwrap();

    assert_eq!(engine.mempool_node(0).unwrap(), 1);

    engine.shutdown();
}

#[test]
fn add_virtio_refuses_numa_migration_once_nic_side_is_ready() {
    let engine = test_engine(&[0, 1]);
    engine.add_vf("eth0", 0, false).unwrap();

    let first: Arc<dyn VhostDev> = Arc::new(FakeVhostDev::new(1, "vm0", None));
    engine.add_virtio(first, 0, None, false).unwrap(); // nic side now READY, node stays 0
    assert_eq!(engine.mempool_node(0).unwrap(), 0);

    engine.remove_virtio(0).unwrap();
    // `remove_virtio` only tears down the vm side; the nic side stays
    // READY (it has its own independent lifecycle via `remove_vf`), so a
    // second attach still finds nic READY and must refuse the migration.
    let second: Arc<dyn VhostDev> = Arc::new(FakeVhostDev::new(1, "vm1", Some(1)));
    engine.add_virtio(second, 0, None, false).unwrap();
    assert_eq!(engine.mempool_node(0).unwrap(), 0, "migration must be refused while nic side is READY");

    engine.shutdown();
}
