//! The name-resolution seam consumed by connect-by-name.
//!
//! The concrete resolver lives in its own crate; the socket layer only
//! needs this trait plus the option bag.

use sockeye_timing::Nanos;

use crate::{
    endpoint::{IpAddress, IpAddressType, TransportProtocol},
    error::Result,
};

/// Options applied to one lookup.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Restrict service lookups to one protocol.
    pub transport: Option<TransportProtocol>,
    /// Restrict host lookups to one address family.
    pub ip_address_type: IpAddressType,
    /// Modular index into the (filtered) result set.
    pub selector: Option<usize>,
    pub deadline: Option<Nanos>,
    /// Ask upstream servers to recurse.
    pub recurse: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            transport: None,
            ip_address_type: IpAddressType::Any,
            selector: None,
            deadline: None,
            recurse: true,
        }
    }
}

/// Where a resolution was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Overrides,
    Cache,
    Database,
    NameServer,
}

/// A successful host lookup.
#[derive(Debug, Clone)]
pub struct IpResolution {
    pub addresses: Vec<IpAddress>,
    /// Minimum remaining TTL across contributing records, in seconds.
    pub ttl: Option<u64>,
    pub source: ResolutionSource,
}

pub type IpCallback = Box<dyn FnOnce(Result<IpResolution>) + Send>;
pub type PortCallback = Box<dyn FnOnce(Result<Vec<u16>>) + Send>;

/// An asynchronous name resolver.
///
/// `EndOfFile` reports an authoritative empty answer; `TimedOut` reports
/// server non-response. The two are never conflated.
pub trait Resolve: Send + Sync {
    fn resolve_ip(&self, name: &str, options: ResolveOptions, callback: IpCallback);
    fn resolve_port(&self, service: &str, options: ResolveOptions, callback: PortCallback);
}

/// Applies the caller's modular selector to a filtered result set.
pub fn select<T: Copy>(items: &[T], selector: Option<usize>) -> Option<T> {
    if items.is_empty() {
        return None;
    }
    match selector {
        Some(index) => Some(items[index % items.len()]),
        None => Some(items[0]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_modular() {
        let items = [10, 20, 30];
        assert_eq!(select(&items, None), Some(10));
        assert_eq!(select(&items, Some(1)), Some(20));
        assert_eq!(select(&items, Some(4)), Some(20));
        assert_eq!(select::<u16>(&[], Some(2)), None);
    }
}
