// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Registry Adapter Abstraction
//!
//! This module defines the narrow key/value contract the cluster directory
//! needs from a registry backend. A backend may be a process-local map, a
//! shared SQLite file, or a remote consistent store; the directory only ever
//! talks to it through [`RegistryAdapter`].
//!
//! ## Contract
//!
//! - `put`, `get`, `delete` and `list` operate on flat string keys. The
//!   directory uses the `nodes/<id>` namespace.
//! - Concurrent writers are tolerated and last-writer-wins is acceptable.
//!   Liveness is layered on top through heartbeats, so backends need not be
//!   strongly consistent.
//! - Every operation may fail with [`Error::Unavailable`]. Callers treat it as
//!   transient.
//! - `watch` is optional. Backends that cannot push changes return `None` and
//!   the directory falls back to polling.
//!
//! ## Testing a Backend
//!
//! ```ignore
//! #[cfg(test)]
//! mod tests {
//!     use super::*;
//!     registry::test_registry_adapter! {
//!         my_backend_conformance: MyRegistry
//!     }
//! }
//! ```
//!

use crate::error::Error;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use tracing::debug;

/// Key/value directory backend.
///
/// Implementations must be cheap to share (`Send + Sync`) because a single
/// adapter is used by the directory, the membership manager and any number of
/// spawned eviction tasks.
#[async_trait]
pub trait RegistryAdapter: Send + Sync + 'static {
    /// Backend name, used in logs.
    fn name(&self) -> &str;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backend cannot be reached.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Reads the value stored under `key`, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backend cannot be reached.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Deletes `key`. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backend cannot be reached.
    async fn delete(&self, key: &str) -> Result<(), Error>;

    /// Lists every `(key, value)` pair whose key starts with `prefix`, in
    /// ascending key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the backend cannot be reached.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error>;

    /// Subscribes to changes under `prefix`.
    ///
    /// The default implementation reports that the backend cannot push
    /// changes.
    fn watch(&self, _prefix: &str) -> Option<Watch> {
        None
    }
}

/// Change notification emitted by a watching backend.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// A key was written.
    Put { key: String, value: Vec<u8> },
    /// A key was deleted.
    Delete { key: String },
    /// The subscriber fell behind and missed this many events. Consumers
    /// should re-read the whole prefix.
    Lagged(u64),
}

impl WatchEvent {
    /// The key this event refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => {
                Some(key.as_str())
            }
            WatchEvent::Lagged(_) => None,
        }
    }
}

/// Stream of [`WatchEvent`]s filtered by key prefix.
pub struct Watch {
    prefix: String,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl Watch {
    /// Creates a watch over a broadcast receiver.
    pub fn new(prefix: &str, receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            receiver,
        }
    }

    /// The watched prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waits for the next event under the watched prefix.
    ///
    /// Returns `None` once the backend has been dropped.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event
                        .key()
                        .is_some_and(|key| key.starts_with(&self.prefix))
                    {
                        return Some(event);
                    }
                }
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(missed)) => {
                    debug!("Watch on '{}' lagged by {} events.", self.prefix, missed);
                    return Some(WatchEvent::Lagged(missed));
                }
            }
        }
    }
}

/// Generates the conformance tests every [`RegistryAdapter`] backend must
/// pass. The backend type must implement `Default`.
#[macro_export]
macro_rules! test_registry_adapter {
    ($name:ident: $type:ty) => {
        #[cfg(test)]
        mod $name {
            use super::*;
            use $crate::adapter::RegistryAdapter;

            #[tokio::test]
            async fn test_put_get() {
                let registry = <$type>::default();
                registry.put("nodes/a", b"alpha").await.unwrap();
                assert_eq!(
                    registry.get("nodes/a").await.unwrap(),
                    Some(b"alpha".to_vec())
                );
            }

            #[tokio::test]
            async fn test_get_absent() {
                let registry = <$type>::default();
                assert_eq!(registry.get("nodes/missing").await.unwrap(), None);
            }

            #[tokio::test]
            async fn test_put_overwrites() {
                let registry = <$type>::default();
                registry.put("nodes/a", b"first").await.unwrap();
                registry.put("nodes/a", b"second").await.unwrap();
                assert_eq!(
                    registry.get("nodes/a").await.unwrap(),
                    Some(b"second".to_vec())
                );
            }

            #[tokio::test]
            async fn test_delete() {
                let registry = <$type>::default();
                registry.put("nodes/a", b"alpha").await.unwrap();
                registry.delete("nodes/a").await.unwrap();
                assert_eq!(registry.get("nodes/a").await.unwrap(), None);
                // Deleting twice is fine.
                registry.delete("nodes/a").await.unwrap();
            }

            #[tokio::test]
            async fn test_list_prefix() {
                let registry = <$type>::default();
                registry.put("nodes/b", b"beta").await.unwrap();
                registry.put("nodes/a", b"alpha").await.unwrap();
                registry.put("other/c", b"gamma").await.unwrap();
                registry.put("nodesx", b"not a node").await.unwrap();
                let listed = registry.list("nodes/").await.unwrap();
                assert_eq!(
                    listed,
                    vec![
                        ("nodes/a".to_owned(), b"alpha".to_vec()),
                        ("nodes/b".to_owned(), b"beta".to_vec()),
                    ]
                );
            }

            #[tokio::test]
            async fn test_list_empty() {
                let registry = <$type>::default();
                assert!(registry.list("nodes/").await.unwrap().is_empty());
            }

            #[tokio::test]
            async fn test_list_prefix_with_wildcards() {
                let registry = <$type>::default();
                registry.put("n%_/a", b"alpha").await.unwrap();
                registry.put("nodes/b", b"beta").await.unwrap();
                let listed = registry.list("n%_/").await.unwrap();
                assert_eq!(listed, vec![("n%_/a".to_owned(), b"alpha".to_vec())]);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_filters_prefix() {
        let (sender, receiver) = broadcast::channel(8);
        let mut watch = Watch::new("nodes/", receiver);
        sender
            .send(WatchEvent::Put {
                key: "other/x".to_owned(),
                value: vec![1],
            })
            .unwrap();
        sender
            .send(WatchEvent::Delete {
                key: "nodes/a".to_owned(),
            })
            .unwrap();
        assert_eq!(
            watch.next().await,
            Some(WatchEvent::Delete {
                key: "nodes/a".to_owned()
            })
        );
        drop(sender);
        assert_eq!(watch.next().await, None);
    }

    #[tokio::test]
    async fn test_watch_reports_lag() {
        let (sender, receiver) = broadcast::channel(1);
        let mut watch = Watch::new("nodes/", receiver);
        for id in ["a", "b", "c"] {
            sender
                .send(WatchEvent::Delete {
                    key: format!("nodes/{}", id),
                })
                .unwrap();
        }
        assert_eq!(watch.next().await, Some(WatchEvent::Lagged(2)));
    }
}
