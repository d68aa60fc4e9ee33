//! Static host and service databases, and the overrides table.
//!
//! Programmatic only: whatever loads system host/services files feeds
//! entries in through these interfaces.

use std::{collections::HashMap, sync::Mutex};

use sockeye::endpoint::{IpAddress, IpAddressType, TransportProtocol};

/// Name to address mappings with a reverse index.
#[derive(Default)]
pub struct HostDatabase {
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    by_name: HashMap<String, Vec<IpAddress>>,
    by_ip: HashMap<IpAddress, String>,
}

impl HostDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, address: IpAddress) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let addresses = state.by_name.entry(name.to_ascii_lowercase()).or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
        state.by_ip.entry(address).or_insert_with(|| name.to_ascii_lowercase());
    }

    pub fn remove(&self, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(addresses) = state.by_name.remove(&name.to_ascii_lowercase()) {
            for address in addresses {
                state.by_ip.remove(&address);
            }
        }
    }

    /// Addresses of `name`, filtered by family.
    pub fn addresses(&self, name: &str, family: IpAddressType) -> Vec<IpAddress> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state
            .by_name
            .get(&name.to_ascii_lowercase())
            .map(|addresses| {
                addresses.iter().copied().filter(|a| a.matches(family)).collect()
            })
            .unwrap_or_default()
    }

    /// Reverse lookup.
    pub fn name_of(&self, address: &IpAddress) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.by_ip.get(address).cloned()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.by_name.is_empty()
    }
}

/// Service name to port mappings, keyed per protocol.
#[derive(Default)]
pub struct PortDatabase {
    state: Mutex<HashMap<(String, TransportProtocol), Vec<u16>>>,
}

impl PortDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service: &str, protocol: TransportProtocol, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let ports = state.entry((service.to_ascii_lowercase(), protocol)).or_default();
        if !ports.contains(&port) {
            ports.push(port);
        }
    }

    /// Ports of `service`; `protocol` of `None` merges tcp and udp entries.
    pub fn ports(&self, service: &str, protocol: Option<TransportProtocol>) -> Vec<u16> {
        let state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let service = service.to_ascii_lowercase();
        match protocol {
            Some(protocol) => state.get(&(service, protocol)).cloned().unwrap_or_default(),
            None => {
                let mut merged = Vec::new();
                for protocol in [TransportProtocol::Tcp, TransportProtocol::Udp] {
                    if let Some(ports) = state.get(&(service.clone(), protocol)) {
                        for port in ports {
                            if !merged.contains(port) {
                                merged.push(*port);
                            }
                        }
                    }
                }
                merged
            }
        }
    }
}
