//! Socket/endpoint binding (§4.8).
//!
//! A 1:1 map between an external-facing socket path and a relay id.
//! Control-plane only; `register`/`deregister` are rare enough that a
//! plain mutex is the right tool (Design Notes reserves the lock-free
//! machinery for the fast path, not this).

use std::sync::Mutex;

use crate::error::{RelayError, Result};
use crate::relay::RelayId;

pub struct EndpointRegistry {
    // index == relay id
    slots: Mutex<Vec<Option<String>>>,
}

impl EndpointRegistry {
    pub fn new(n_relays: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; n_relays]),
        }
    }

    /// Rejects if `id` already has an endpoint registered (§4.8).
    pub fn register(&self, path: &str, id: RelayId) -> Result<()> {
        let mut slots = self.slots.lock().unwrap();
        let idx = id as usize;
        let slot = slots
            .get_mut(idx)
            .ok_or_else(|| RelayError::InvalidArg(format!("relay id {id} out of range")))?;
        if slot.is_some() {
            return Err(RelayError::AlreadyBound(format!(
                "relay {id} already has an endpoint"
            )));
        }
        if slots.iter().any(|s| s.as_deref() == Some(path)) {
            return Err(RelayError::InvalidArg(format!(
                "endpoint path {path} already registered"
            )));
        }
        slots[idx] = Some(path.to_string());
        Ok(())
    }

    /// Reverse lookup by path, clearing the slot. `NotBound` if the path is
    /// not currently registered.
    pub fn deregister(&self, path: &str) -> Result<RelayId> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots
            .iter()
            .position(|s| s.as_deref() == Some(path))
            .ok_or_else(|| RelayError::NotBound(format!("no relay bound to endpoint {path}")))?;
        slots[idx] = None;
        Ok(idx as RelayId)
    }

    pub fn relay_for(&self, path: &str) -> Option<RelayId> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .position(|s| s.as_deref() == Some(path))
            .map(|i| i as RelayId)
    }

    pub fn endpoint_for(&self, id: RelayId) -> Option<String> {
        self.slots.lock().unwrap().get(id as usize)?.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_reverse_lookup() {
        let reg = EndpointRegistry::new(4);
        reg.register("/tmp/a.sock", 2).unwrap();
        assert_eq!(reg.relay_for("/tmp/a.sock"), Some(2));
        assert_eq!(reg.endpoint_for(2), Some("/tmp/a.sock".to_string()));
    }

    #[test]
    fn register_twice_on_same_relay_rejected() {
        let reg = EndpointRegistry::new(4);
        reg.register("/tmp/a.sock", 2).unwrap();
        assert!(reg.register("/tmp/b.sock", 2).is_err());
    }

    #[test]
    fn deregister_unknown_path_rejected() {
        let reg = EndpointRegistry::new(4);
        assert!(reg.deregister("/tmp/missing.sock").is_err());
    }

    #[test]
    fn deregister_frees_slot_for_reuse() {
        let reg = EndpointRegistry::new(4);
        reg.register("/tmp/a.sock", 1).unwrap();
        assert_eq!(reg.deregister("/tmp/a.sock").unwrap(), 1);
        reg.register("/tmp/a.sock", 1).unwrap();
        assert_eq!(reg.relay_for("/tmp/a.sock"), Some(1));
    }
}
