// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!

use super::{Inbound, Transport, INBOUND_CAPACITY};
use crate::Error;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tracing::debug;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

const FIRST_PORT: u32 = 10_000;

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, mpsc::Sender<Vec<u8>>>,
    partitioned: HashSet<String>,
    next_port: u32,
}

/// An in-process message bus shared by every node bound to it.
///
/// Frames sent to or from a partitioned address are silently dropped, the way
/// a real network loses packets. Sending to an address nobody is bound to
/// fails immediately.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a new endpoint. An address ending in `:0` gets a fresh port.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` if the address is already bound.
    pub fn bind(&self, address: &str) -> Result<(MemoryTransport, Inbound), Error> {
        let mut state = self.state.write().map_err(|e| {
            Error::Transport(format!("Can not lock network: {}", e))
        })?;

        let address = match address.strip_suffix(":0") {
            Some(host) => loop {
                let port = FIRST_PORT + state.next_port;
                state.next_port += 1;
                let candidate = format!("{}:{}", host, port);
                if !state.endpoints.contains_key(&candidate) {
                    break candidate;
                }
            },
            None => address.to_owned(),
        };

        if state.endpoints.contains_key(&address) {
            return Err(Error::Transport(format!(
                "address {} already in use",
                address
            )));
        }

        let (sender, receiver) = mpsc::channel(INBOUND_CAPACITY);
        state.endpoints.insert(address.clone(), sender);
        debug!("Memory endpoint bound at {}.", address);

        Ok((
            MemoryTransport {
                network: self.clone(),
                address,
            },
            receiver,
        ))
    }

    /// Drops every frame sent to or from `address` until [`heal`] is called.
    ///
    /// [`heal`]: MemoryNetwork::heal
    pub fn partition(&self, address: &str) {
        if let Ok(mut state) = self.state.write() {
            debug!("Partitioning {}.", address);
            state.partitioned.insert(address.to_owned());
        }
    }

    pub fn heal(&self, address: &str) {
        if let Ok(mut state) = self.state.write() {
            debug!("Healing {}.", address);
            state.partitioned.remove(address);
        }
    }

    pub fn is_bound(&self, address: &str) -> bool {
        self.state
            .read()
            .map(|state| state.endpoints.contains_key(address))
            .unwrap_or_default()
    }

    fn unbind(&self, address: &str) {
        if let Ok(mut state) = self.state.write() {
            state.endpoints.remove(address);
        }
    }
}

/// A node's endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn send(&self, address: &str, frame: Vec<u8>) -> Result<(), Error> {
        let sender = {
            let state = self.network.state.read().map_err(|e| {
                Error::Transport(format!("Can not lock network: {}", e))
            })?;
            if state.partitioned.contains(&self.address)
                || state.partitioned.contains(address)
            {
                debug!("Dropping frame {} -> {} (partitioned).", self.address, address);
                return Ok(());
            }
            state.endpoints.get(address).cloned()
        };

        match sender {
            Some(sender) => sender.send(frame).await.map_err(|_| {
                Error::Transport(format!("endpoint {} is closed", address))
            }),
            None => Err(Error::Transport(format!(
                "no endpoint bound at {}",
                address
            ))),
        }
    }

    async fn close(&self) {
        debug!("Closing memory endpoint {}.", self.address);
        self.network.unbind(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = MemoryNetwork::new();
        let (a, _inbound_a) = network.bind("127.0.0.1:0").unwrap();
        let (b, mut inbound_b) = network.bind("127.0.0.1:0").unwrap();
        assert_ne!(a.local_address(), b.local_address());

        a.send(&b.local_address(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(inbound_b.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let network = MemoryNetwork::new();
        let _bound = network.bind("node-a:7000").unwrap();
        assert!(matches!(
            network.bind("node-a:7000"),
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_address_fails() {
        let network = MemoryNetwork::new();
        let (a, _inbound) = network.bind("127.0.0.1:0").unwrap();
        assert!(matches!(
            a.send("127.0.0.1:1", vec![1]).await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_partition_drops_both_directions() {
        let network = MemoryNetwork::new();
        let (a, mut inbound_a) = network.bind("127.0.0.1:0").unwrap();
        let (b, mut inbound_b) = network.bind("127.0.0.1:0").unwrap();

        network.partition(&b.local_address());
        a.send(&b.local_address(), vec![1]).await.unwrap();
        b.send(&a.local_address(), vec![2]).await.unwrap();
        assert!(inbound_a.try_recv().is_err());
        assert!(inbound_b.try_recv().is_err());

        network.heal(&b.local_address());
        a.send(&b.local_address(), vec![3]).await.unwrap();
        assert_eq!(inbound_b.recv().await, Some(vec![3]));
    }

    #[tokio::test]
    async fn test_close_unbinds() {
        let network = MemoryNetwork::new();
        let (a, _inbound) = network.bind("127.0.0.1:0").unwrap();
        let address = a.local_address();
        assert!(network.is_bound(&address));
        a.close().await;
        assert!(!network.is_bound(&address));
    }
}
