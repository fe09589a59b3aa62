//! Connectivity signals supplied by the host.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Kind of network the device is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Offline,
}

impl NetworkType {
    pub fn is_online(self) -> bool {
        self != NetworkType::Offline
    }

    fn to_u8(self) -> u8 {
        match self {
            NetworkType::Wifi => 0,
            NetworkType::Cellular => 1,
            NetworkType::Offline => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => NetworkType::Wifi,
            1 => NetworkType::Cellular,
            _ => NetworkType::Offline,
        }
    }
}

/// Read-only view of the device's connectivity.
///
/// Consulted on every sync attempt; implementations must answer from live
/// state rather than a value cached at engine start.
pub trait ConnectivityProbe: Send + Sync {
    fn network_type(&self) -> NetworkType;

    fn is_online(&self) -> bool {
        self.network_type().is_online()
    }
}

/// Connectivity the host updates from its own network callbacks.
///
/// Clones share the same state.
#[derive(Debug, Clone)]
pub struct SharedConnectivity {
    state: Arc<AtomicU8>,
}

impl SharedConnectivity {
    pub fn new(initial: NetworkType) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(initial.to_u8())),
        }
    }

    pub fn set(&self, network: NetworkType) {
        self.state.store(network.to_u8(), Ordering::SeqCst);
    }
}

impl Default for SharedConnectivity {
    fn default() -> Self {
        Self::new(NetworkType::Wifi)
    }
}

impl ConnectivityProbe for SharedConnectivity {
    fn network_type(&self) -> NetworkType {
        NetworkType::from_u8(self.state.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_connectivity_updates_clones() {
        let probe = SharedConnectivity::new(NetworkType::Cellular);
        let host_side = probe.clone();
        assert!(probe.is_online());

        host_side.set(NetworkType::Offline);
        assert_eq!(probe.network_type(), NetworkType::Offline);
        assert!(!probe.is_online());
    }
}
