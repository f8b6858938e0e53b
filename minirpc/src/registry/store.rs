use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use foldhash::fast::RandomState;
use tokio::time::Instant;

use crate::instance::{InstanceKey, InstanceMeta};

#[derive(Debug, Default)]
struct Tables {
    /// protocol -> registered instances.
    instances: HashMap<Option<String>, HashSet<InstanceMeta, RandomState>, RandomState>,
    /// instance -> time of its last register call.
    last_seen: HashMap<InstanceKey, Instant, RandomState>,
}

/// The registry's instance table.
///
/// Both tables live behind one lock so that an instance is present in
/// `last_seen` exactly when it is present in its protocol bucket.
#[derive(Debug, Default)]
pub struct RegistryStore {
    tables: Mutex<Tables>,
}

impl RegistryStore {
    /// Registers `instance`, or refreshes its heartbeat if it is already
    /// registered. Returns the stored instance, which keeps the parameters
    /// of the first registration. Never fails.
    pub fn register(&self, instance: InstanceMeta) -> InstanceMeta {
        self.register_at(instance, Instant::now())
    }

    pub fn register_at(&self, mut instance: InstanceMeta, now: Instant) -> InstanceMeta {
        instance.set_status(true);
        let key = instance.key();

        let mut guard = self.lock();
        let tables = &mut *guard;
        let bucket = tables.instances.entry(key.protocol.clone()).or_default();
        if let Some(stored) = bucket.get(&instance) {
            if let Some(previous) = tables.last_seen.insert(key, now) {
                tracing::info!(
                    "heartbeat from {instance}, previous one {:?} ago",
                    now.saturating_duration_since(previous)
                );
            }
            stored.clone()
        } else {
            tracing::info!("register instance {instance}");
            bucket.insert(instance.clone());
            tables.last_seen.insert(key, now);
            instance
        }
    }

    /// Removes `instance`. Unregistering an unknown instance is a no-op that
    /// still reports the instance as not alive.
    pub fn unregister(&self, mut instance: InstanceMeta) -> InstanceMeta {
        instance.set_status(false);
        let mut tables = self.lock();
        if Self::remove_locked(&mut tables, &instance) {
            tracing::info!("unregister instance {instance}");
        } else {
            tracing::info!("unregister an instance not found {instance}");
        }
        instance
    }

    /// A snapshot of the instances registered under `protocol`.
    #[must_use]
    pub fn find_instances_by_protocol(&self, protocol: Option<&str>) -> Vec<InstanceMeta> {
        let tables = self.lock();
        tables
            .instances
            .get(&protocol.map(str::to_string))
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Unregisters every instance whose last heartbeat is more than
    /// `threshold` older than `now`, returning the evicted instances.
    pub fn sweep_expired(&self, now: Instant, threshold: Duration) -> Vec<InstanceMeta> {
        let mut tables = self.lock();
        if tables.last_seen.is_empty() {
            tracing::info!("health check: instance list is empty");
            return Vec::new();
        }

        let expired: Vec<InstanceKey> = tables
            .last_seen
            .iter()
            .filter_map(|(key, &last_seen)| {
                let age = now.saturating_duration_since(last_seen);
                if age > threshold {
                    tracing::info!("health check: {key:?} is unhealthy, last seen {age:?} ago");
                    Some(key.clone())
                } else {
                    tracing::debug!("health check: {key:?} is healthy, last seen {age:?} ago");
                    None
                }
            })
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for key in expired {
            let mut lookup = InstanceMeta {
                protocol: key.protocol,
                host: key.host,
                port: key.port,
                ..Default::default()
            };
            if let Some(stored) = tables
                .instances
                .get(&lookup.protocol)
                .and_then(|bucket| bucket.get(&lookup))
            {
                lookup = stored.clone();
            }
            Self::remove_locked(&mut tables, &lookup);
            lookup.set_status(false);
            tracing::info!("evict instance {lookup}");
            evicted.push(lookup);
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().last_seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_locked(tables: &mut Tables, instance: &InstanceMeta) -> bool {
        let Some(bucket) = tables.instances.get_mut(&instance.protocol) else {
            return false;
        };
        if !bucket.remove(instance) {
            return false;
        }
        if bucket.is_empty() {
            tables.instances.remove(&instance.protocol);
        }
        tables.last_seen.remove(&instance.key());
        true
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
