// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Directory
//!
//! Cluster-wide mapping of node id to [`NodeDescriptor`], backed by a
//! [`RegistryAdapter`] under the `nodes/<id>` namespace.
//!
//! The registry is authoritative but possibly slow; the directory keeps a
//! local cache of [`DirectoryEntry`] values whose `alive` flag is driven by
//! the membership manager without a registry round trip. Discovery of new
//! nodes goes through [`Directory::refresh`] and [`Directory::refresh_node`].
//!
//! The local node is cached too, with no heartbeat timestamp, and is always
//! alive.
//!
//! Only the failure detector decides that a node is dead, and only a real
//! heartbeat or frame brings it back. A node evicted from this cache keeps a
//! tombstone for `heartbeat_timeout`; records found under a tombstoned id
//! are cached as not alive. A record that vanishes from the registry
//! while its node is alive is reported as departed but kept.
//!

use crate::Error;

use registry::{RegistryAdapter, WatchEvent};

use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time::Instant};
use uuid::Uuid;

use tracing::{debug, info, warn};

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Registry namespace of node descriptors.
pub const NODES_PREFIX: &str = "nodes/";

/// Registry key of a node descriptor.
pub fn node_key(id: &str) -> String {
    format!("{}{}", NODES_PREFIX, id)
}

/// Wall clock milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// What a node publishes about itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    /// Transport address.
    pub address: String,
    /// Advertised actor names.
    pub actors: BTreeSet<String>,
    /// Random per process start. Two records with the same id and different
    /// incarnations belong to different processes.
    pub incarnation: String,
    /// Bumped whenever `actors` or `address` change.
    pub version: u64,
    /// Wall clock of the last publish, in milliseconds since the epoch.
    pub heartbeat_at_ms: u64,
}

impl NodeDescriptor {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_owned(),
            address: address.to_owned(),
            actors: BTreeSet::new(),
            incarnation: Uuid::new_v4().to_string(),
            version: 0,
            heartbeat_at_ms: now_ms(),
        }
    }

    pub fn hosts(&self, actor: &str) -> bool {
        self.actors.contains(actor)
    }

    /// Whether the record was published less than `timeout` ago.
    pub fn is_fresh(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.heartbeat_at_ms) <= timeout.as_millis() as u64
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Cached view of a descriptor plus derived liveness.
#[derive(Clone, Debug, PartialEq)]
pub struct DirectoryEntry {
    pub descriptor: NodeDescriptor,
    pub alive: bool,
    /// Last sign of life. `None` for the local node.
    pub last_heartbeat: Option<Instant>,
}

impl DirectoryEntry {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn is_local(&self) -> bool {
        self.last_heartbeat.is_none()
    }
}

/// Changes found by a [`Directory::refresh`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Ids inserted as alive.
    pub discovered: Vec<String>,
    /// Alive ids whose record is missing from the registry. They stay
    /// cached.
    pub departed: Vec<String>,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<String, DirectoryEntry>,
    /// Eviction time of evicted ids. Records of these ids are cached as not
    /// alive until the heartbeat timeout has passed.
    evicted: HashMap<String, Instant>,
    /// Alive ids already reported as departed.
    missing: HashSet<String>,
}

impl Cache {
    /// Caches the record of an unknown node. Returns `Some(alive)` when it
    /// was inserted, `None` when it was ignored.
    fn admit(&mut self, descriptor: NodeDescriptor, timeout: Duration) -> Option<bool> {
        if !descriptor.is_fresh(now_ms(), timeout) {
            debug!("Ignoring expired record of node {}.", descriptor.id);
            return None;
        }
        let alive = !self.evicted.contains_key(&descriptor.id);
        if alive {
            info!("Discovered node {} at {}.", descriptor.id, descriptor.address);
        } else {
            debug!("Caching evicted node {} as not alive.", descriptor.id);
        }
        self.evicted.remove(&descriptor.id);
        self.entries.insert(
            descriptor.id.clone(),
            DirectoryEntry {
                descriptor,
                alive,
                last_heartbeat: Some(Instant::now()),
            },
        );
        Some(alive)
    }
}

/// The directory of one node.
pub struct Directory {
    local_id: String,
    registry: Arc<dyn RegistryAdapter>,
    heartbeat_timeout: Duration,
    cache: RwLock<Cache>,
}

impl Directory {
    pub fn new(
        local_id: &str,
        registry: Arc<dyn RegistryAdapter>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            local_id: local_id.to_owned(),
            registry,
            heartbeat_timeout,
            cache: RwLock::new(Cache::default()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn registry(&self) -> &Arc<dyn RegistryAdapter> {
        &self.registry
    }

    /// Publishes `descriptor` under `nodes/<id>` and caches it.
    ///
    /// # Errors
    ///
    /// Returns `Error::IdConflict` when the registry holds a fresh record
    /// with the same id written by another incarnation, and
    /// `Error::RegistryUnavailable` when the registry cannot be reached.
    pub async fn upsert(&self, descriptor: NodeDescriptor) -> Result<(), Error> {
        let key = node_key(&descriptor.id);

        if let Some(bytes) = self.registry.get(&key).await? {
            match NodeDescriptor::decode(&bytes) {
                Ok(existing)
                    if existing.incarnation != descriptor.incarnation
                        && existing.is_fresh(now_ms(), self.heartbeat_timeout) =>
                {
                    return Err(Error::IdConflict(descriptor.id));
                }
                Ok(_) => {}
                Err(e) => warn!("Overwriting unreadable record {}: {}", key, e),
            }
        }

        self.registry.put(&key, &descriptor.encode()?).await?;

        let mut cache = self.cache.write().await;
        let local = descriptor.id == self.local_id;
        match cache.entries.get_mut(&descriptor.id) {
            Some(entry) => entry.descriptor = descriptor,
            None => {
                cache.entries.insert(
                    descriptor.id.clone(),
                    DirectoryEntry {
                        descriptor,
                        alive: true,
                        last_heartbeat: if local { None } else { Some(Instant::now()) },
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn lookup(&self, id: &str) -> Option<DirectoryEntry> {
        self.cache.read().await.entries.get(id).cloned()
    }

    /// Snapshot of every cached entry, in no particular order.
    pub async fn all(&self) -> Vec<DirectoryEntry> {
        self.cache.read().await.entries.values().cloned().collect()
    }

    /// Drops the cache entry of `id`, leaving a tombstone for remote nodes.
    /// The registry is not touched.
    pub async fn forget(&self, id: &str) {
        let mut cache = self.cache.write().await;
        if cache.entries.remove(id).is_some() && id != self.local_id {
            cache.evicted.insert(id.to_owned(), Instant::now());
        }
    }

    /// Deletes the registry record of `id` and forgets it.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryUnavailable` if the record cannot be deleted.
    /// The cache entry is dropped anyway.
    pub async fn remove(&self, id: &str) -> Result<(), Error> {
        self.forget(id).await;
        self.registry.delete(&node_key(id)).await?;
        debug!("Node {} removed from {} registry.", id, self.registry.name());
        Ok(())
    }

    /// Records a sign of life of `id`. Returns `true` if the entry was not
    /// alive before.
    pub async fn mark_alive(&self, id: &str, at: Instant) -> bool {
        let mut cache = self.cache.write().await;
        match cache.entries.get_mut(id) {
            Some(entry) if !entry.is_local() => {
                let revived = !entry.alive;
                entry.alive = true;
                entry.last_heartbeat = Some(at);
                revived
            }
            _ => false,
        }
    }

    /// Flags `id` as not alive. Returns `true` if it was alive before.
    pub async fn mark_stale(&self, id: &str) -> bool {
        let mut cache = self.cache.write().await;
        match cache.entries.get_mut(id) {
            Some(entry) if !entry.is_local() => std::mem::replace(&mut entry.alive, false),
            _ => false,
        }
    }

    /// Reconciles the cache with the registry.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryUnavailable` if the registry cannot be listed.
    pub async fn refresh(&self) -> Result<RefreshReport, Error> {
        let records = self.registry.list(NODES_PREFIX).await?;
        let mut listed = HashSet::new();
        let mut report = RefreshReport::default();

        let mut cache = self.cache.write().await;
        let timeout = self.heartbeat_timeout;
        cache.evicted.retain(|_, at| at.elapsed() < timeout);

        for (key, bytes) in records {
            let descriptor = match NodeDescriptor::decode(&bytes) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", key, e);
                    continue;
                }
            };
            if descriptor.id == self.local_id {
                continue;
            }

            if let Some(entry) = cache.entries.get_mut(&descriptor.id) {
                // An expired record does not keep a dead node cached.
                if entry.alive || descriptor.is_fresh(now_ms(), timeout) {
                    listed.insert(descriptor.id.clone());
                }
                entry.descriptor = descriptor;
            } else {
                listed.insert(descriptor.id.clone());
                let id = descriptor.id.clone();
                if cache.admit(descriptor, timeout) == Some(true) {
                    report.discovered.push(id);
                }
            }
        }

        let local_id = &self.local_id;
        let Cache {
            entries, missing, ..
        } = &mut *cache;
        missing.retain(|id| !listed.contains(id) && entries.contains_key(id));
        entries.retain(|id, entry| {
            if id == local_id || listed.contains(id) {
                return true;
            }
            if entry.alive {
                if missing.insert(id.clone()) {
                    debug!("Record of node {} is missing from the registry.", id);
                    report.departed.push(id.clone());
                }
                return true;
            }
            let expired = entry
                .last_heartbeat
                .is_some_and(|at| at.elapsed() >= timeout);
            if expired {
                debug!("Pruning dead node {}.", id);
            }
            !expired
        });

        Ok(report)
    }

    /// Reads the record of a single node. Returns `true` if the node was
    /// not known and has been inserted as alive. Tombstoned nodes are
    /// inserted as not alive.
    ///
    /// # Errors
    ///
    /// Returns `Error::RegistryUnavailable` if the registry cannot be read.
    pub async fn refresh_node(&self, id: &str) -> Result<bool, Error> {
        if id == self.local_id {
            return Ok(false);
        }
        let Some(bytes) = self.registry.get(&node_key(id)).await? else {
            return Ok(false);
        };
        let descriptor = NodeDescriptor::decode(&bytes)?;

        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.entries.get_mut(id) {
            entry.descriptor = descriptor;
            return Ok(false);
        }
        Ok(cache.admit(descriptor, self.heartbeat_timeout) == Some(true))
    }

    /// Whether a registry watch event tells this cache something new about
    /// another node: a deletion, a missed event, or a record that is unknown
    /// or differs in address, version or incarnation.
    pub async fn is_news(&self, event: &WatchEvent) -> bool {
        match event {
            WatchEvent::Lagged(_) => true,
            WatchEvent::Delete { key } => *key != node_key(&self.local_id),
            WatchEvent::Put { value, .. } => {
                let Ok(descriptor) = NodeDescriptor::decode(value) else {
                    return false;
                };
                if descriptor.id == self.local_id {
                    return false;
                }
                match self.lookup(&descriptor.id).await {
                    Some(entry) => {
                        let cached = &entry.descriptor;
                        cached.version != descriptor.version
                            || cached.address != descriptor.address
                            || cached.incarnation != descriptor.incarnation
                    }
                    None => true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use registry::MemoryRegistry;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn directory(id: &str, registry: &MemoryRegistry) -> Directory {
        Directory::new(id, Arc::new(registry.clone()), TIMEOUT)
    }

    fn descriptor(id: &str, actors: &[&str]) -> NodeDescriptor {
        let mut descriptor = NodeDescriptor::new(id, &format!("{}:1", id));
        descriptor.actors = actors.iter().map(|a| a.to_string()).collect();
        descriptor
    }

    #[tokio::test]
    async fn test_upsert_publishes_and_caches() {
        let registry = MemoryRegistry::new();
        let directory = directory("a", &registry);
        let local = descriptor("a", &["echo"]);
        directory.upsert(local.clone()).await.unwrap();

        let bytes = registry.get(&node_key("a")).await.unwrap().unwrap();
        assert_eq!(NodeDescriptor::decode(&bytes).unwrap(), local);

        let entry = directory.lookup("a").await.unwrap();
        assert!(entry.alive);
        assert!(entry.is_local());
        assert!(!directory.mark_stale("a").await);
    }

    #[tokio::test]
    async fn test_id_conflict_is_rejected() {
        let registry = MemoryRegistry::new();
        directory("a", &registry)
            .upsert(descriptor("a", &[]))
            .await
            .unwrap();

        let impostor = directory("a", &registry);
        assert_eq!(
            impostor.upsert(descriptor("a", &[])).await,
            Err(Error::IdConflict("a".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_expired_record_is_overwritten() {
        let registry = MemoryRegistry::new();
        let mut old = descriptor("a", &[]);
        old.heartbeat_at_ms = now_ms() - 60_000;
        registry.put(&node_key("a"), &old.encode().unwrap()).await.unwrap();

        let directory = directory("a", &registry);
        assert!(directory.upsert(descriptor("a", &[])).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_discovers_and_departs() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let b = directory("b", &registry);
        a.upsert(descriptor("a", &[])).await.unwrap();
        b.upsert(descriptor("b", &["echo"])).await.unwrap();

        let report = a.refresh().await.unwrap();
        assert_eq!(report.discovered, vec!["b".to_owned()]);
        let entry = a.lookup("b").await.unwrap();
        assert!(entry.alive && entry.descriptor.hosts("echo"));
        assert_eq!(a.all().await.len(), 2);

        assert_eq!(a.refresh().await.unwrap(), RefreshReport::default());

        // A missing record is reported but does not end the node.
        registry.delete(&node_key("b")).await.unwrap();
        let report = a.refresh().await.unwrap();
        assert_eq!(report.departed, vec!["b".to_owned()]);
        assert!(a.lookup("b").await.unwrap().alive);
        assert!(a.refresh().await.unwrap().departed.is_empty());
        assert!(a.lookup("a").await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_liveness_of_known_nodes() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let b = directory("b", &registry);
        b.upsert(descriptor("b", &[])).await.unwrap();
        a.refresh().await.unwrap();

        assert!(a.mark_stale("b").await);
        let mut updated = descriptor("b", &["echo"]);
        updated.incarnation = a.lookup("b").await.unwrap().descriptor.incarnation;
        updated.version = 1;
        b.upsert(updated).await.unwrap();

        a.refresh().await.unwrap();
        let entry = a.lookup("b").await.unwrap();
        assert!(!entry.alive);
        assert_eq!(entry.descriptor.version, 1);
        assert!(entry.descriptor.hosts("echo"));

        assert!(a.mark_alive("b", Instant::now()).await);
        assert!(a.lookup("b").await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_expired_records_are_not_discovered() {
        let registry = MemoryRegistry::new();
        let mut stale = descriptor("b", &[]);
        stale.heartbeat_at_ms = now_ms() - 60_000;
        registry.put(&node_key("b"), &stale.encode().unwrap()).await.unwrap();

        let a = directory("a", &registry);
        assert!(a.refresh().await.unwrap().discovered.is_empty());
        assert!(!a.refresh_node("b").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_node_needs_a_sign_of_life() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let record = descriptor("b", &[]);
        registry.put(&node_key("b"), &record.encode().unwrap()).await.unwrap();
        a.refresh().await.unwrap();

        a.remove("b").await.unwrap();
        assert!(registry.get(&node_key("b")).await.unwrap().is_none());
        assert!(a.lookup("b").await.is_none());

        // The node publishes again: cached, but not alive.
        let mut republished = record.clone();
        republished.heartbeat_at_ms += 1;
        registry
            .put(&node_key("b"), &republished.encode().unwrap())
            .await
            .unwrap();
        assert!(a.refresh().await.unwrap().discovered.is_empty());
        assert!(!a.lookup("b").await.unwrap().alive);
        assert!(!a.refresh_node("b").await.unwrap());

        tokio::time::advance(TIMEOUT).await;
        assert!(a.refresh().await.unwrap().discovered.is_empty());
        assert!(!a.lookup("b").await.unwrap().alive);

        assert!(a.mark_alive("b", Instant::now()).await);
        assert!(a.lookup("b").await.unwrap().alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_keeps_the_registry_record() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let record = descriptor("b", &[]);
        registry.put(&node_key("b"), &record.encode().unwrap()).await.unwrap();
        a.refresh().await.unwrap();

        a.forget("b").await;
        assert!(a.lookup("b").await.is_none());
        assert!(registry.get(&node_key("b")).await.unwrap().is_some());
        assert!(!a.refresh_node("b").await.unwrap());
        assert!(!a.lookup("b").await.unwrap().alive);

        // Out of the registry and silent: pruned after the timeout.
        registry.delete(&node_key("b")).await.unwrap();
        tokio::time::advance(TIMEOUT).await;
        a.refresh().await.unwrap();
        assert!(a.lookup("b").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_records_do_not_keep_dead_nodes() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let mut record = descriptor("b", &[]);
        registry.put(&node_key("b"), &record.encode().unwrap()).await.unwrap();
        a.refresh().await.unwrap();
        a.mark_stale("b").await;

        record.heartbeat_at_ms = now_ms() - 60_000;
        registry.put(&node_key("b"), &record.encode().unwrap()).await.unwrap();
        tokio::time::advance(TIMEOUT).await;
        a.refresh().await.unwrap();
        assert!(a.lookup("b").await.is_none());
    }

    #[tokio::test]
    async fn test_only_changes_of_other_nodes_are_news() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        let b = descriptor("b", &[]);
        registry.put(&node_key("b"), &b.encode().unwrap()).await.unwrap();
        a.refresh().await.unwrap();

        let put = |descriptor: &NodeDescriptor| WatchEvent::Put {
            key: node_key(&descriptor.id),
            value: descriptor.encode().unwrap(),
        };

        let mut beat = b.clone();
        beat.heartbeat_at_ms += 1_000;
        assert!(!a.is_news(&put(&beat)).await);
        assert!(!a.is_news(&put(&descriptor("a", &[]))).await);
        assert!(!a
            .is_news(&WatchEvent::Delete {
                key: node_key("a")
            })
            .await);

        let mut moved = b.clone();
        moved.version += 1;
        assert!(a.is_news(&put(&moved)).await);
        assert!(a.is_news(&put(&descriptor("c", &[]))).await);
        assert!(a
            .is_news(&WatchEvent::Delete {
                key: node_key("b")
            })
            .await);
        assert!(a.is_news(&WatchEvent::Lagged(3)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_unlisted_nodes_are_pruned() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        registry
            .put(&node_key("b"), &descriptor("b", &[]).encode().unwrap())
            .await
            .unwrap();
        a.refresh().await.unwrap();
        a.mark_stale("b").await;
        registry.delete(&node_key("b")).await.unwrap();

        let report = a.refresh().await.unwrap();
        assert!(report.departed.is_empty());
        assert!(a.lookup("b").await.is_some());

        tokio::time::advance(TIMEOUT).await;
        a.refresh().await.unwrap();
        assert!(a.lookup("b").await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_registry() {
        let registry = MemoryRegistry::new();
        let a = directory("a", &registry);
        registry.set_available(false);
        assert!(matches!(
            a.refresh().await,
            Err(Error::RegistryUnavailable(_))
        ));
        assert!(matches!(
            a.upsert(descriptor("a", &[])).await,
            Err(Error::RegistryUnavailable(_))
        ));
    }
}
