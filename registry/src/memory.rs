// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Memory registry implementation.
//!

use crate::{
    adapter::{RegistryAdapter, Watch, WatchEvent},
    error::Error,
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use tracing::debug;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

const WATCH_CAPACITY: usize = 256;

/// A registry that keeps its records in process memory.
///
/// Clones share the same records and the same availability switch. Use
/// [`MemoryRegistry::handle`] to get a view that shares the records but can
/// be made unavailable on its own, which is how tests model one node losing
/// its registry connection.
#[derive(Clone)]
pub struct MemoryRegistry {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    events: broadcast::Sender<WatchEvent>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            events,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns a view over the same records with its own availability
    /// switch.
    pub fn handle(&self) -> Self {
        Self {
            data: self.data.clone(),
            events: self.events.clone(),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Makes every operation through this view succeed or fail with
    /// [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        debug!("Memory registry availability set to {}.", available);
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|data| data.len()).unwrap_or_default()
    }

    /// True when no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), Error> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("memory registry is offline".to_owned()))
        }
    }
}

#[async_trait]
impl RegistryAdapter for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.check()?;
        {
            let mut lock = self.data.write().map_err(|e| {
                Error::Unavailable(format!("Can not lock data: {}", e))
            })?;
            lock.insert(key.to_owned(), value.to_vec());
        }
        let _ = self.events.send(WatchEvent::Put {
            key: key.to_owned(),
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.check()?;
        let lock = self
            .data
            .read()
            .map_err(|e| Error::Unavailable(format!("Can not lock data: {}", e)))?;
        Ok(lock.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.check()?;
        let removed = {
            let mut lock = self.data.write().map_err(|e| {
                Error::Unavailable(format!("Can not lock data: {}", e))
            })?;
            lock.remove(key).is_some()
        };
        if removed {
            let _ = self.events.send(WatchEvent::Delete {
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        self.check()?;
        let lock = self
            .data
            .read()
            .map_err(|e| Error::Unavailable(format!("Can not lock data: {}", e)))?;
        Ok(lock
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Option<Watch> {
        Some(Watch::new(prefix, self.events.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_registry_adapter;

    test_registry_adapter! {
        unit_test_memory_registry: crate::memory::MemoryRegistry
    }

    #[tokio::test]
    async fn test_unavailable() {
        let registry = MemoryRegistry::new();
        registry.put("nodes/a", b"alpha").await.unwrap();
        registry.set_available(false);
        assert!(matches!(
            registry.get("nodes/a").await,
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            registry.list("nodes/").await,
            Err(Error::Unavailable(_))
        ));
        registry.set_available(true);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_has_own_availability() {
        let registry = MemoryRegistry::new();
        let handle = registry.handle();
        handle.set_available(false);
        registry.put("nodes/a", b"alpha").await.unwrap();
        assert!(handle.get("nodes/a").await.is_err());
        handle.set_available(true);
        assert_eq!(
            handle.get("nodes/a").await.unwrap(),
            Some(b"alpha".to_vec())
        );
    }

    #[tokio::test]
    async fn test_watch_sees_puts_and_deletes() {
        let registry = MemoryRegistry::new();
        let mut watch = registry.watch("nodes/").unwrap();
        registry.put("nodes/a", b"alpha").await.unwrap();
        registry.delete("nodes/missing").await.unwrap();
        registry.delete("nodes/a").await.unwrap();
        assert_eq!(
            watch.next().await,
            Some(WatchEvent::Put {
                key: "nodes/a".to_owned(),
                value: b"alpha".to_vec()
            })
        );
        assert_eq!(
            watch.next().await,
            Some(WatchEvent::Delete {
                key: "nodes/a".to_owned()
            })
        );
    }
}
