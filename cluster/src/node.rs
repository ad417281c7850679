// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Node
//!
//! The facade application code uses: join the cluster, host actors, resolve
//! actor names to [`RemoteActorRef`]s and leave.
//!
//! ```ignore
//! let registry = Arc::new(MemoryRegistry::new());
//! let node = Node::start_tcp(NodeConfig::default().with_id("a"), registry).await?;
//! node.register_actor("echo", Echo).await?;
//!
//! for echo in node.find("echo").await {
//!     let answer: u64 = echo.ask("echo", &42u64).await?;
//! }
//!
//! node.shutdown().await;
//! ```
//!
//! Shutdown is explicit: [`Node::shutdown`] sends a `Leave` to every alive
//! node, stops the background tasks, fails outstanding calls with
//! `Error::Shutdown`, stops local actors, closes the transport and removes
//! the node's registry record. Dropping
//! the last handle only stops the background tasks.
//!

use crate::{
    diagnostics::{Diagnostics, NodeReport, DIAGNOSTICS_ACTOR},
    directory::{now_ms, Directory, DirectoryEntry, NodeDescriptor},
    dispatcher::{Dispatcher, DispatcherStats},
    local::{Actor, LocalActors},
    membership::{MemberState, Members, Membership},
    proxy::RemoteActorRef,
    transport::{Inbound, MemoryNetwork, TcpTransport, Transport},
    Error, NodeConfig,
};

use registry::RegistryAdapter;

use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use futures::future::join_all;
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracing::{debug, error, info, warn};

use std::{collections::BTreeMap, sync::Arc};

/// A running cluster node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    pub(crate) id: String,
    config: NodeConfig,
    local: Arc<RwLock<NodeDescriptor>>,
    directory: Arc<Directory>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) members: Members,
    actors: LocalActors,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Joins the cluster on an already bound transport.
    ///
    /// The node id comes from the configuration or is generated. The local
    /// descriptor is published before any task starts; while the registry
    /// is unavailable the publish is retried with exponential backoff up to
    /// `registry_retries` times.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidConfig` if the configuration does not validate.
    /// - `Error::IdConflict` if another live process holds the id.
    /// - `Error::RegistryUnavailable` if every attempt failed.
    pub async fn start(
        config: NodeConfig,
        registry: Arc<dyn RegistryAdapter>,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Result<Self, Error> {
        if let Err(e) = config.validate() {
            transport.close().await;
            return Err(e);
        }

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let address = transport.local_address();
        let directory = Arc::new(Directory::new(
            &id,
            registry,
            config.heartbeat_timeout,
        ));
        let local = Arc::new(RwLock::new(NodeDescriptor::new(&id, &address)));

        if let Err(e) = join(&directory, &local, &config).await {
            error!("Node {} can not join the cluster: {}", id, e);
            transport.close().await;
            return Err(e);
        }

        let token = CancellationToken::new();
        let actors = LocalActors::new();
        let (observations, observed) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            &id,
            &config,
            transport.clone(),
            Arc::new(actors.clone()),
            observations.clone(),
            token.clone(),
        );
        let mut tasks = dispatcher.start(inbound);

        match directory.refresh().await {
            Ok(report) => {
                for id in report.discovered {
                    let _ = observations
                        .send(crate::membership::Observation::Discovered(id));
                }
            }
            Err(e) => warn!("Initial directory read failed: {}", e),
        }

        let members = Members::default();
        let membership = Membership::new(
            &config,
            local.clone(),
            directory.clone(),
            dispatcher.clone(),
            members.clone(),
            observations,
        );
        tasks.extend(membership.start(observed, token.clone()));

        let node = Node {
            inner: Arc::new(NodeInner {
                id,
                config,
                local,
                directory,
                dispatcher,
                members,
                actors,
                transport,
                token,
                tasks: Mutex::new(tasks),
            }),
        };

        let diagnostics = Diagnostics::new(Arc::downgrade(&node.inner));
        if let Err(e) = node.register_actor(DIAGNOSTICS_ACTOR, diagnostics).await {
            node.shutdown().await;
            return Err(e);
        }

        info!("Node {} joined the cluster at {}.", node.id(), address);
        Ok(node)
    }

    /// Binds a [`TcpTransport`] on `config.address` and joins.
    ///
    /// # Errors
    ///
    /// `Error::Transport` if the address cannot be bound, otherwise as
    /// [`Node::start`].
    pub async fn start_tcp(
        config: NodeConfig,
        registry: Arc<dyn RegistryAdapter>,
    ) -> Result<Self, Error> {
        let (transport, inbound) = TcpTransport::bind(&config.address).await?;
        let transport = transport.with_io_timeout(config.call_timeout);
        Self::start(config, registry, Arc::new(transport), inbound).await
    }

    /// Binds `config.address` on an in-process network and joins.
    ///
    /// # Errors
    ///
    /// `Error::Transport` if the address is taken, otherwise as
    /// [`Node::start`].
    pub async fn start_in(
        network: &MemoryNetwork,
        config: NodeConfig,
        registry: Arc<dyn RegistryAdapter>,
    ) -> Result<Self, Error> {
        let (transport, inbound) = network.bind(&config.address)?;
        Self::start(config, registry, Arc::new(transport), inbound).await
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> String {
        self.inner.transport.local_address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Starts `actor` locally under `name` and advertises it.
    ///
    /// A registry failure while advertising is logged; the actor is
    /// advertised again with the next heartbeat.
    ///
    /// # Errors
    ///
    /// `Error::ActorExists` if the name is taken, or the actor's own
    /// `pre_start` error.
    pub async fn register_actor<A: Actor>(&self, name: &str, actor: A) -> Result<(), Error> {
        self.inner.actors.spawn(name, actor).await?;
        self.inner.advertise().await;
        Ok(())
    }

    /// Stops the local actor `name` and withdraws it. Returns `false` if no
    /// such actor was running.
    pub async fn unregister_actor(&self, name: &str) -> bool {
        let stopped = self.inner.actors.stop(name).await;
        if stopped {
            self.inner.advertise().await;
        }
        stopped
    }

    /// Proxies for every live node advertising `actor`, ordered by node id.
    ///
    /// Reads the directory cache only. Nodes that are dead or vanish while
    /// the proxies are built are skipped with a warning.
    pub async fn find(&self, actor: &str) -> Vec<RemoteActorRef> {
        let mut proxies = Vec::new();
        for entry in self.inner.directory.all().await {
            if !entry.descriptor.hosts(actor) {
                continue;
            }
            match self.inner.proxy(&entry, actor).await {
                Ok(proxy) => proxies.push(proxy),
                Err(e) => warn!(
                    "Skipping node {} while resolving {}: {}",
                    entry.id(),
                    actor,
                    e
                ),
            }
        }
        proxies.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        debug!("Resolved {} to {} node(s).", actor, proxies.len());
        proxies
    }

    /// Proxy for `actor` on the node `node_id`, if the directory knows the
    /// node. The actor need not be advertised.
    pub async fn resolve_one(&self, actor: &str, node_id: &str) -> Option<RemoteActorRef> {
        let entry = self.inner.directory.lookup(node_id).await?;
        Some(self.inner.proxy_unchecked(&entry, actor))
    }

    /// Names of the actors hosted by this node.
    pub async fn local_actors(&self) -> Vec<String> {
        self.inner.actors.names().await
    }

    /// The descriptor this node publishes.
    pub async fn descriptor(&self) -> NodeDescriptor {
        self.inner.local.read().await.clone()
    }

    pub async fn member_state(&self, id: &str) -> Option<MemberState> {
        self.inner.members.state(id).await
    }

    pub async fn members(&self) -> BTreeMap<String, MemberState> {
        self.inner.members.snapshot().await
    }

    /// Snapshot of the directory cache.
    pub async fn directory(&self) -> Vec<DirectoryEntry> {
        self.inner.directory.all().await
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.inner.dispatcher.stats().await
    }

    pub async fn report(&self) -> NodeReport {
        self.inner.report().await
    }

    /// Leaves the cluster. Calling it twice is harmless.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.token.is_cancelled() {
            return;
        }
        info!("Node {} is leaving the cluster.", inner.id);
        inner.announce_leave().await;
        inner.token.cancel();

        let tasks = std::mem::take(&mut *inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task of {} failed: {}", inner.id, e);
            }
        }

        inner.dispatcher.fail_all(Error::Shutdown).await;
        inner.actors.stop_all().await;
        inner.transport.close().await;
        if let Err(e) = inner.directory.remove(&inner.id).await {
            warn!("Node {} could not remove its record: {}", inner.id, e);
        }
        debug!("Node {} stopped.", inner.id);
    }
}

impl NodeInner {
    /// Tells every alive remote node that this node is going away.
    async fn announce_leave(&self) {
        let peers: Vec<DirectoryEntry> = self
            .directory
            .all()
            .await
            .into_iter()
            .filter(|entry| entry.alive && !entry.is_local())
            .collect();
        let sent = join_all(peers.iter().map(|entry| async move {
            let result = self.dispatcher.send_leave(&entry.descriptor.address).await;
            if let Err(e) = &result {
                debug!("Leave to {} failed: {}", entry.id(), e);
            }
            result.is_ok()
        }))
        .await;
        debug!(
            "Node {} announced its leave to {} of {} nodes.",
            self.id,
            sent.into_iter().filter(|ok| *ok).count(),
            peers.len()
        );
    }

    async fn advertise(&self) {
        let actors = self.actors.names().await;
        let descriptor = {
            let mut local = self.local.write().await;
            local.actors = actors.into_iter().collect();
            local.version += 1;
            local.heartbeat_at_ms = now_ms();
            local.clone()
        };
        if let Err(e) = self.directory.upsert(descriptor).await {
            warn!("Can not advertise actors of {}: {}", self.id, e);
        }
    }

    async fn proxy(&self, entry: &DirectoryEntry, actor: &str) -> Result<RemoteActorRef, Error> {
        if !entry.alive {
            return Err(Error::NodeUnreachable(entry.id().to_owned()));
        }
        // The node may have been evicted since the scan.
        match self.directory.lookup(entry.id()).await {
            Some(current) if current.alive => Ok(self.proxy_unchecked(&current, actor)),
            _ => Err(Error::NodeUnreachable(entry.id().to_owned())),
        }
    }

    fn proxy_unchecked(&self, entry: &DirectoryEntry, actor: &str) -> RemoteActorRef {
        RemoteActorRef::new(
            entry.id(),
            &entry.descriptor.address,
            actor,
            self.config.call_timeout,
            self.dispatcher.clone(),
            self.directory.clone(),
        )
    }

    pub(crate) async fn report(&self) -> NodeReport {
        NodeReport {
            descriptor: self.local.read().await.clone(),
            members: self.members.snapshot().await,
            actors: self.actors.names().await,
            stats: self.dispatcher.stats().await,
        }
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Publishes the local descriptor, retrying while the registry is
/// unavailable.
async fn join(
    directory: &Directory,
    local: &RwLock<NodeDescriptor>,
    config: &NodeConfig,
) -> Result<(), Error> {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.heartbeat_rate / 10)
        .with_max_interval(config.heartbeat_rate)
        .with_max_elapsed_time(None)
        .build();
    let mut attempts = 0;

    loop {
        let descriptor = {
            let mut local = local.write().await;
            local.heartbeat_at_ms = now_ms();
            local.clone()
        };
        match directory.upsert(descriptor).await {
            Ok(()) => return Ok(()),
            Err(Error::RegistryUnavailable(reason)) if attempts < config.registry_retries => {
                attempts += 1;
                let delay = backoff.next_backoff().unwrap_or(config.heartbeat_rate);
                warn!(
                    "Registry unavailable ({}), join attempt {} in {:?}.",
                    reason, attempts, delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
