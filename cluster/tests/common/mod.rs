// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

// Shared fixtures of the cluster integration tests.

#![allow(dead_code)]

use cluster::{Actor, Failure, MemoryNetwork, Node, NodeConfig, Payload};
use registry::MemoryRegistry;

use async_trait::async_trait;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

pub const RATE: Duration = Duration::from_secs(1);
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Echo actor used across the tests.
///
/// - `echo`: returns its arguments.
/// - `answer`: returns `42u64` after 100 ms.
/// - `slow`: takes `(delay_ms, tag)` and returns `tag` after the delay.
/// - `fail`: fails with a method error.
/// - `explode`: panics.
pub struct Echo;

#[async_trait]
impl Actor for Echo {
    async fn handle(&mut self, method: &str, args: Payload) -> Result<Payload, Failure> {
        match method {
            "echo" => Ok(args),
            "answer" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                encode(&42u64)
            }
            "slow" => {
                let (delay, tag): (u64, u64) = decode(&args)?;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                encode(&tag)
            }
            "fail" => Err(Failure::method("refused")),
            "explode" => panic!("echo exploded"),
            _ => Err(Failure::method_not_found(method)),
        }
    }
}

/// Actor counting the `hit` casts it receives.
pub struct Counter {
    pub hits: Arc<AtomicU64>,
}

#[async_trait]
impl Actor for Counter {
    async fn handle(&mut self, method: &str, _args: Payload) -> Result<Payload, Failure> {
        match method {
            "hit" => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::empty())
            }
            _ => Err(Failure::method_not_found(method)),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Payload, Failure> {
    Payload::encode(value).map_err(|e| Failure::method(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(args: &Payload) -> Result<T, Failure> {
    args.decode().map_err(|e| Failure::method(e.to_string()))
}

pub fn config(id: &str) -> NodeConfig {
    NodeConfig::default()
        .with_id(id)
        .with_heartbeat(RATE, TIMEOUT)
        .with_call_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_millis(100))
}

/// Starts a node on `network` with its own view of `registry`.
pub async fn start(network: &MemoryNetwork, registry: &MemoryRegistry, id: &str) -> Node {
    Node::start_in(network, config(id), Arc::new(registry.clone()))
        .await
        .unwrap()
}

/// Models a crash: the node loses the registry and the network.
pub fn halt(network: &MemoryNetwork, registry: &MemoryRegistry, node: &Node) {
    registry.set_available(false);
    network.partition(&node.address());
}

/// Lets heartbeats and registry reads settle.
pub async fn settle() {
    tokio::time::sleep(RATE + RATE / 2).await;
}
