//! The resolver front-end: overrides → cache → static database → servers.

use std::sync::Arc;

use sockeye::{
    endpoint::IpAddress,
    error::{Error, ErrorKind},
    global,
    interface::Interface,
    resolve::{
        IpCallback, IpResolution, PortCallback, Resolve, ResolveOptions, ResolutionSource,
        select,
    },
};
use sockeye_timing::Nanos;
use tracing::debug;

use crate::{
    cache::{CacheLookup, HostCache},
    client::DnsClient,
    config::ResolverConfig,
    db::{HostDatabase, PortDatabase},
};

/// Seconds a freshly learned empty answer stays in the negative cache.
const NEGATIVE_TTL: u64 = 30;

/// The in-process resolver.
pub struct Resolver {
    config: ResolverConfig,
    cache: Arc<HostCache>,
    overrides: HostDatabase,
    hosts: HostDatabase,
    ports: PortDatabase,
    client: DnsClient,
}

impl Resolver {
    pub fn new(interface: Arc<Interface>, config: ResolverConfig) -> Arc<Self> {
        let client = DnsClient::new(
            interface,
            config.servers.clone(),
            config.attempts,
            config.timeout,
        );
        Arc::new(Self {
            cache: Arc::new(HostCache::new(config.positive_cache, config.negative_cache)),
            overrides: HostDatabase::new(),
            hosts: HostDatabase::new(),
            ports: PortDatabase::new(),
            client,
            config,
        })
    }

    /// Installs this resolver as the process default.
    pub fn install_as_default(self: &Arc<Self>) -> sockeye::Result<()> {
        global::set_default_resolver(Arc::clone(self) as Arc<dyn Resolve>)
    }

    /// The overrides table, consulted before anything else.
    pub fn overrides(&self) -> &HostDatabase {
        &self.overrides
    }

    /// The static host database, consulted after the cache.
    pub fn host_database(&self) -> &HostDatabase {
        &self.hosts
    }

    /// The static service database.
    pub fn port_database(&self) -> &PortDatabase {
        &self.ports
    }

    pub fn cache(&self) -> &HostCache {
        &self.cache
    }

    /// Reverse lookup served from the cache, then the static databases.
    pub fn get_domain_name(&self, address: &IpAddress) -> Option<String> {
        self.cache
            .get_domain_name(address, Nanos::now())
            .or_else(|| self.overrides.name_of(address))
            .or_else(|| self.hosts.name_of(address))
    }

    fn deliver(
        addresses: Vec<IpAddress>,
        ttl: Option<u64>,
        source: ResolutionSource,
        selector: Option<usize>,
        callback: IpCallback,
    ) {
        let addresses = match select(&addresses, selector) {
            Some(selected) if selector.is_some() => vec![selected],
            _ => addresses,
        };
        callback(Ok(IpResolution { addresses, ttl, source }));
    }
}

impl Resolve for Resolver {
    fn resolve_ip(&self, name: &str, options: ResolveOptions, callback: IpCallback) {
        // IP literals bypass everything.
        if let Ok(literal) = name.parse::<std::net::IpAddr>() {
            let address: IpAddress = literal.into();
            if address.matches(options.ip_address_type) {
                callback(Ok(IpResolution {
                    addresses: vec![address],
                    ttl: None,
                    source: ResolutionSource::Overrides,
                }));
            } else {
                callback(Err(Error::new(ErrorKind::EndOfFile)));
            }
            return;
        }

        let overridden = self.overrides.addresses(name, options.ip_address_type);
        if !overridden.is_empty() {
            debug!(name, "resolved from overrides");
            Self::deliver(
                overridden,
                None,
                ResolutionSource::Overrides,
                options.selector,
                callback,
            );
            return;
        }

        match self.cache.get_ip_addresses(
            name,
            Nanos::now(),
            options.ip_address_type,
            self.config.sort_v4_first,
            options.selector,
        ) {
            CacheLookup::Hit { addresses, min_ttl } => {
                debug!(name, "resolved from cache");
                callback(Ok(IpResolution {
                    addresses,
                    ttl: Some(min_ttl),
                    source: ResolutionSource::Cache,
                }));
                return;
            }
            CacheLookup::NegativeHit => {
                debug!(name, "negative cache hit");
                callback(Err(Error::new(ErrorKind::EndOfFile)));
                return;
            }
            CacheLookup::Miss => {}
        }

        let known = self.hosts.addresses(name, options.ip_address_type);
        if !known.is_empty() {
            debug!(name, "resolved from host database");
            Self::deliver(
                known,
                None,
                ResolutionSource::Database,
                options.selector,
                callback,
            );
            return;
        }

        if !self.client.has_servers() {
            callback(Err(Error::new(ErrorKind::EndOfFile)));
            return;
        }

        // The query outlives this call; the continuation owns what it needs.
        let owned_name = name.to_string();
        let selector = options.selector;
        let cache = Arc::clone(&self.cache);
        self.client.lookup(
            name,
            options.ip_address_type,
            options.recurse,
            options.deadline,
            Box::new(move |result| match result {
                Ok(records) => {
                    let now = Nanos::now();
                    let mut min_ttl = u64::MAX;
                    let mut addresses = Vec::with_capacity(records.len());
                    for (address, ttl) in records {
                        cache.update_host(&owned_name, address, None, u64::from(ttl), now);
                        min_ttl = min_ttl.min(u64::from(ttl));
                        addresses.push(address);
                    }
                    Self::deliver(
                        addresses,
                        Some(min_ttl),
                        ResolutionSource::NameServer,
                        selector,
                        callback,
                    );
                }
                Err(err) => {
                    if err.kind() == ErrorKind::EndOfFile {
                        cache.update_negative(&owned_name, NEGATIVE_TTL, Nanos::now());
                    }
                    callback(Err(err));
                }
            }),
        );
    }

    fn resolve_port(&self, service: &str, options: ResolveOptions, callback: PortCallback) {
        // Numeric literals bypass the database.
        if let Ok(port) = service.parse::<u16>() {
            callback(Ok(vec![port]));
            return;
        }
        let ports = self.ports.ports(service, options.transport);
        if ports.is_empty() {
            callback(Err(Error::new(ErrorKind::EndOfFile)));
            return;
        }
        let ports = match select(&ports, options.selector) {
            Some(selected) if options.selector.is_some() => vec![selected],
            _ => ports,
        };
        callback(Ok(ports));
    }
}
