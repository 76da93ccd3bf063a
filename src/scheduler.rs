//! Core-selection policy (§4.5).
//!
//! Consulted on `add_virtio`/`add_vf` when the caller did not supply an
//! explicit pin, and to validate one when it did. Pure function of the
//! current relay table and topology — no state of its own.

use crate::error::{RelayError, Result};
use crate::relay::Relay;
use crate::topology::{CoreId, NodeId, Topology};

/// Per-direction load weights (§4.5 point 2).
fn weighted_load(relays: &[Relay], core: CoreId) -> u32 {
    let mut load = 0u32;
    for relay in relays {
        if relay.vm.cpu.get() == Some(core) {
            load += crate::constants::VM_TO_NIC_WEIGHT;
        }
        if relay.nic.cpu.get() == Some(core) {
            load += crate::constants::NIC_TO_VM_WEIGHT;
        }
    }
    load
}

/// Validates an explicit pin against the worker-core-bitmap (§4.5: "use it
/// after validating it is in the worker-core-bitmap").
pub fn validate_pin(topology: &dyn Topology, core: CoreId) -> Result<CoreId> {
    if topology.is_initialized(core) {
        Ok(core)
    } else {
        Err(RelayError::InvalidArg(format!(
            "core {core} is not in the worker-core-bitmap"
        )))
    }
}

/// Selects a core for a new direction: prefer a core on `preferred_node`,
/// then minimize the weighted load across all relays' pins (§4.5 point 1-2).
pub fn select_core(
    topology: &dyn Topology,
    relays: &[Relay],
    preferred_node: Option<NodeId>,
) -> Result<CoreId> {
    let all_cores = topology.all_cores();
    if all_cores.is_empty() {
        return Err(RelayError::BackendFail(
            "no worker cores configured".to_string(),
        ));
    }

    let candidates = preferred_node
        .map(|node| topology.cores_on_node(node))
        .filter(|cores| !cores.is_empty())
        .unwrap_or(all_cores);

    candidates
        .into_iter()
        .min_by_key(|&core| (weighted_load(relays, core), core))
        .ok_or_else(|| RelayError::BackendFail("no candidate cores".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::Mempool;
    use crate::topology::SingleNodeTopology;

    fn relay_on(id: u32, vm_cpu: Option<CoreId>, nic_cpu: Option<CoreId>) -> Relay {
        let relay = Relay::new(id, Mempool::new(0, 2048), 0, false);
        relay.vm.cpu.set(vm_cpu);
        relay.nic.cpu.set(nic_cpu);
        relay
    }

    #[test]
    fn picks_least_loaded_core() {
        let topo = SingleNodeTopology::new([0, 1, 2]);
        let relays = vec![relay_on(0, Some(0), Some(0)), relay_on(1, Some(1), None)];
        // core 0: 10 + 12 = 22, core 1: 10, core 2: 0
        let picked = select_core(&topo, &relays, None).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn prefers_candidates_on_numa_node() {
        let topo = SingleNodeTopology::new([0, 1]);
        let relays = vec![];
        let picked = select_core(&topo, &relays, Some(0)).unwrap();
        assert_eq!(picked, 0); // tie broken by lowest id
    }

    #[test]
    fn rejects_uninitialized_pin() {
        let topo = SingleNodeTopology::new([0, 1]);
        assert!(validate_pin(&topo, 5).is_err());
        assert!(validate_pin(&topo, 1).is_ok());
    }

    #[test]
    fn errors_when_no_cores_configured() {
        let topo = SingleNodeTopology::new([]);
        assert!(select_core(&topo, &[], None).is_err());
    }
}
