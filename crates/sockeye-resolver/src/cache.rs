//! The in-process host cache.
//!
//! Entries live in a slab arena; a domain multimap and an ip map both hold
//! slot indices, and one mutex guards all three. Indices never escape the
//! lock, so slots need no generation tags. Expired entries are evicted on
//! first access.

use std::{collections::HashMap, sync::Mutex};

use sockeye::endpoint::{IpAddress, IpAddressType, IpEndpoint};
use sockeye_timing::Nanos;
use tracing::debug;

/// One cached address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub domain: String,
    pub ip: IpAddress,
    pub name_server: Option<IpEndpoint>,
    /// Time to live, seconds.
    pub ttl: u64,
    pub last_update: Nanos,
    /// Always `last_update + ttl`.
    pub expiration: Nanos,
}

#[derive(Default)]
struct State {
    slots: Vec<Option<HostEntry>>,
    free: Vec<usize>,
    by_domain: HashMap<String, Vec<usize>>,
    by_ip: HashMap<IpAddress, usize>,
    negative: HashMap<String, Nanos>,
}

impl State {
    fn insert_slot(&mut self, entry: HostEntry) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    /// Removes `slot` from the arena and both indices.
    fn evict(&mut self, slot: usize) {
        let Some(entry) = self.slots[slot].take() else {
            return;
        };
        self.free.push(slot);
        if let Some(slots) = self.by_domain.get_mut(&entry.domain) {
            slots.retain(|s| *s != slot);
            if slots.is_empty() {
                self.by_domain.remove(&entry.domain);
            }
        }
        self.by_ip.remove(&entry.ip);
    }
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Live addresses plus the minimum remaining TTL (seconds) across the
    /// contributing entries.
    Hit { addresses: Vec<IpAddress>, min_ttl: u64 },
    /// A cached authoritative empty answer is still in force.
    NegativeHit,
    Miss,
}

/// Positive/negative host cache with explicit-time operations.
pub struct HostCache {
    state: Mutex<State>,
    positive_enabled: bool,
    negative_enabled: bool,
}

impl HostCache {
    pub fn new(positive_enabled: bool, negative_enabled: bool) -> Self {
        Self { state: Mutex::new(State::default()), positive_enabled, negative_enabled }
    }

    /// Inserts or refreshes the `(domain, ip)` record. An existing record
    /// is updated in place; a new one registers in both indices.
    pub fn update_host(
        &self,
        domain: &str,
        ip: IpAddress,
        name_server: Option<IpEndpoint>,
        ttl: u64,
        now: Nanos,
    ) {
        if !self.positive_enabled {
            return;
        }
        let domain = domain.to_ascii_lowercase();
        let expiration = now + Nanos::from_secs(ttl);
        let mut state = self.lock();

        // A fresh answer supersedes a cached negative result.
        state.negative.remove(&domain);

        if let Some(slots) = state.by_domain.get(&domain) {
            for slot in slots.clone() {
                let Some(entry) = state.slots[slot].as_mut() else {
                    continue;
                };
                if entry.ip == ip {
                    entry.name_server = name_server;
                    entry.ttl = ttl;
                    entry.last_update = now;
                    entry.expiration = expiration;
                    return;
                }
            }
        }

        let slot = state.insert_slot(HostEntry {
            domain: domain.clone(),
            ip,
            name_server,
            ttl,
            last_update: now,
            expiration,
        });
        state.by_domain.entry(domain).or_default().push(slot);
        if let Some(stale) = state.by_ip.insert(ip, slot) {
            // The ip index is single-valued; the address moved domains.
            if stale != slot {
                state.evict(stale);
            }
        }
    }

    /// Records an authoritative empty answer for `domain`.
    pub fn update_negative(&self, domain: &str, ttl: u64, now: Nanos) {
        if !self.negative_enabled {
            return;
        }
        let mut state = self.lock();
        state.negative.insert(domain.to_ascii_lowercase(), now + Nanos::from_secs(ttl));
    }

    /// Looks `domain` up at time `now`, evicting anything expired, then
    /// filters by family, optionally sorts v4 first, and applies the
    /// modular selector.
    pub fn get_ip_addresses(
        &self,
        domain: &str,
        now: Nanos,
        family: IpAddressType,
        sort_v4_first: bool,
        selector: Option<usize>,
    ) -> CacheLookup {
        let domain = domain.to_ascii_lowercase();
        let mut state = self.lock();

        match state.negative.get(&domain).copied() {
            Some(expiration) if now < expiration => return CacheLookup::NegativeHit,
            Some(_) => {
                state.negative.remove(&domain);
            }
            None => {}
        }

        let Some(slots) = state.by_domain.get(&domain).cloned() else {
            return CacheLookup::Miss;
        };

        let mut live: Vec<(IpAddress, u64)> = Vec::new();
        for slot in slots {
            let Some(entry) = state.slots[slot].as_ref() else {
                continue;
            };
            if now >= entry.expiration {
                debug!(domain = %entry.domain, ip = %entry.ip, "evicting expired host entry");
                state.evict(slot);
                continue;
            }
            let remaining = (entry.expiration - now).0 / 1_000_000_000;
            live.push((entry.ip, remaining));
        }

        let mut filtered: Vec<(IpAddress, u64)> =
            live.into_iter().filter(|(ip, _)| ip.matches(family)).collect();
        if filtered.is_empty() {
            return CacheLookup::Miss;
        }
        if sort_v4_first {
            filtered.sort_by_key(|(ip, _)| ip.is_v6());
        }

        let min_ttl = filtered.iter().map(|(_, ttl)| *ttl).min().unwrap_or(0);
        let addresses: Vec<IpAddress> = match selector {
            Some(index) => vec![filtered[index % filtered.len()].0],
            None => filtered.into_iter().map(|(ip, _)| ip).collect(),
        };
        CacheLookup::Hit { addresses, min_ttl }
    }

    /// Reverse lookup at time `now`, evicting an expired entry on access.
    pub fn get_domain_name(&self, ip: &IpAddress, now: Nanos) -> Option<String> {
        let mut state = self.lock();
        let slot = *state.by_ip.get(ip)?;
        let entry = state.slots[slot].as_ref()?;
        if now >= entry.expiration {
            state.evict(slot);
            return None;
        }
        Some(entry.domain.clone())
    }

    /// Number of live slots (expired-but-unvisited entries included).
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        *state = State::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
