use std::{
    collections::HashSet,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use foldhash::fast::RandomState;
use rand::seq::SliceRandom;

use crate::instance::InstanceMeta;

/// A dialable server address as cached by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The address of a registered instance; `None` if it lacks a host or
    /// port.
    #[must_use]
    pub fn from_instance(instance: &InstanceMeta) -> Option<Self> {
        instance
            .address()
            .map(|(host, port)| Self::new(host, port))
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The client's set of known live servers.
///
/// Written by the discovery poller and by call-time eviction, read by every
/// call.
#[derive(Debug, Default)]
pub struct ServerCache {
    servers: Mutex<HashSet<ServerAddr, RandomState>>,
}

impl ServerCache {
    /// Replaces the cache with the result of a successful fetch: servers
    /// missing from `fetched` are dropped, new ones added, shared ones kept.
    pub fn merge(&self, fetched: impl IntoIterator<Item = ServerAddr>) {
        let fetched: HashSet<ServerAddr, RandomState> = fetched.into_iter().collect();
        let mut servers = self.lock();
        servers.retain(|addr| fetched.contains(addr));
        servers.extend(fetched);
    }

    /// Sorted copy of the current servers.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ServerAddr> {
        let mut servers: Vec<_> = self.lock().iter().cloned().collect();
        servers.sort();
        servers
    }

    /// Drops `addr`; returns whether it was cached.
    pub fn evict(&self, addr: &ServerAddr) -> bool {
        self.lock().remove(addr)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ServerAddr, RandomState>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Picks one server for a call.
pub trait LoadBalance: Send + Sync + std::fmt::Debug {
    fn choose<'a>(&self, servers: &'a [ServerAddr]) -> Option<&'a ServerAddr>;
}

/// Uniform random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomBalance;

impl LoadBalance for RandomBalance {
    fn choose<'a>(&self, servers: &'a [ServerAddr]) -> Option<&'a ServerAddr> {
        servers.choose(&mut rand::thread_rng())
    }
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalance for RoundRobin {
    fn choose<'a>(&self, servers: &'a [ServerAddr]) -> Option<&'a ServerAddr> {
        if servers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ServerAddr {
        ServerAddr::new("127.0.0.1", port)
    }

    #[test]
    fn test_merge_replaces_stale_servers() {
        let cache = ServerCache::default();
        cache.merge([addr(1), addr(2)]);
        cache.merge([addr(2), addr(3)]);
        assert_eq!(cache.snapshot(), vec![addr(2), addr(3)]);

        // an empty successful fetch clears the cache.
        cache.merge([]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict() {
        let cache = ServerCache::default();
        cache.merge([addr(1), addr(2)]);
        assert!(cache.evict(&addr(1)));
        assert!(!cache.evict(&addr(1)));
        assert_eq!(cache.snapshot(), vec![addr(2)]);
    }

    #[test]
    fn test_from_instance() {
        let instance = InstanceMeta::new("json", "::1", 8000);
        let server = ServerAddr::from_instance(&instance).unwrap();
        assert_eq!(server.to_string(), "[::1]:8000");
        assert_eq!(ServerAddr::from_instance(&InstanceMeta::default()), None);
    }

    #[test]
    fn test_random_balance_is_roughly_uniform() {
        let servers = vec![addr(1), addr(2), addr(3)];
        let mut counts = [0usize; 3];
        for _ in 0..3000 {
            let chosen = RandomBalance.choose(&servers).unwrap();
            counts[usize::from(chosen.port - 1)] += 1;
        }
        for count in counts {
            assert!((700..1300).contains(&count), "{counts:?}");
        }
        assert_eq!(RandomBalance.choose(&[]), None);
    }

    #[test]
    fn test_round_robin() {
        let servers = vec![addr(1), addr(2)];
        let balance = RoundRobin::default();
        let picked: Vec<u16> = (0..4)
            .map(|_| balance.choose(&servers).unwrap().port)
            .collect();
        assert_eq!(picked, vec![1, 2, 1, 2]);
        assert_eq!(balance.choose(&[]), None);
    }
}
