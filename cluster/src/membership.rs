// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Node membership
//!
//! Heartbeat-based failure detection. Two tasks run per node:
//!
//! - The heartbeat task republishes the local descriptor every
//!   `heartbeat_rate`, reconciles the directory with the registry and
//!   broadcasts a `Heartbeat` to every known node. Registry watch events
//!   that change what the directory knows trigger an immediate
//!   reconciliation.
//! - The detector task tracks one [`MemberState`] per remote node. Every
//!   heartbeat or frame observed by the dispatcher resets the node's timer.
//!   After `suspect_after` of silence the node is suspected, after
//!   `heartbeat_timeout` it is dead: its directory entry is marked not
//!   alive, its pending calls fail with `NodeUnreachable` and its registry
//!   record is removed. A dead node is forgotten once the directory no
//!   longer holds it.
//!
//! Registry records only discover nodes. A missing record makes an alive
//! node suspected and a dead node stays dead until it is heard from again.
//! A node that announces its departure with a `Leave` is dropped at once.
//!
//! The two tasks never wait on each other, so a slow registry cannot delay
//! failure detection.
//!

use crate::{
    directory::{now_ms, Directory, NodeDescriptor, NODES_PREFIX},
    dispatcher::Dispatcher,
    NodeConfig,
};

use registry::{Watch, WatchEvent};

use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{mpsc, RwLock},
    task::JoinHandle,
    time::{interval, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

/// Liveness of a remote node as seen by the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    Alive,
    /// Silent for longer than a heartbeat period but not yet evicted.
    Suspected,
    Dead,
}

/// Event fed to the detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Observation {
    /// A `Heartbeat` message arrived.
    Heartbeat { node_id: String, version: u64 },
    /// Any other frame arrived from this node.
    Traffic(String),
    /// The directory inserted this node from a registry record.
    Discovered(String),
    /// The node's registry record is missing while it is alive.
    Departed(String),
    /// The node announced that it is shutting down.
    Left(String),
}

pub(crate) type ObservationSender = mpsc::UnboundedSender<Observation>;
pub(crate) type ObservationReceiver = mpsc::UnboundedReceiver<Observation>;

/// Shared read view of the detector's states.
#[derive(Clone, Default)]
pub struct Members {
    states: Arc<RwLock<HashMap<String, MemberState>>>,
}

impl Members {
    pub async fn state(&self, id: &str) -> Option<MemberState> {
        self.states.read().await.get(id).copied()
    }

    /// Every tracked node with its state, ordered by id.
    pub async fn snapshot(&self) -> BTreeMap<String, MemberState> {
        self.states
            .read()
            .await
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect()
    }

    async fn set(&self, id: &str, state: MemberState) {
        self.states.write().await.insert(id.to_owned(), state);
    }

    async fn forget(&self, id: &str) {
        self.states.write().await.remove(id);
    }
}

struct Member {
    state: MemberState,
    last_seen: Instant,
    version: u64,
    /// When a dead member is next checked against the directory.
    recheck: Option<Instant>,
}

impl Member {
    fn new(now: Instant, version: u64) -> Self {
        Self {
            state: MemberState::Alive,
            last_seen: now,
            version,
            recheck: None,
        }
    }

    fn deadline(&self, suspect_after: Duration, timeout: Duration) -> Option<Instant> {
        match self.state {
            MemberState::Alive => Some(self.last_seen + suspect_after),
            MemberState::Suspected => Some(self.last_seen + timeout),
            MemberState::Dead => self.recheck,
        }
    }
}

/// Membership manager of one node.
pub(crate) struct Membership {
    local: Arc<RwLock<NodeDescriptor>>,
    directory: Arc<Directory>,
    dispatcher: Arc<Dispatcher>,
    members: Members,
    observations: ObservationSender,
    heartbeat_rate: Duration,
    heartbeat_timeout: Duration,
    suspect_after: Duration,
}

impl Membership {
    pub fn new(
        config: &NodeConfig,
        local: Arc<RwLock<NodeDescriptor>>,
        directory: Arc<Directory>,
        dispatcher: Arc<Dispatcher>,
        members: Members,
        observations: ObservationSender,
    ) -> Self {
        Self {
            local,
            directory,
            dispatcher,
            members,
            observations,
            heartbeat_rate: config.heartbeat_rate,
            heartbeat_timeout: config.heartbeat_timeout,
            suspect_after: config.suspect_after(),
        }
    }

    /// Spawns the heartbeat and detector tasks.
    pub fn start(
        self,
        observations: ObservationReceiver,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let membership = Arc::new(self);
        vec![
            tokio::spawn(membership.clone().heartbeat_loop(token.clone())),
            tokio::spawn(membership.detector_loop(observations, token)),
        ]
    }

    async fn heartbeat_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(self.heartbeat_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watch = self.directory.registry().watch(NODES_PREFIX);

        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let version = self.publish().await;
                    self.refresh().await;
                    self.broadcast(version).await;
                }
                event = next_event(&mut watch) => match event {
                    Some(event) => {
                        if self.directory.is_news(&event).await {
                            self.refresh().await;
                        }
                    }
                    None => {
                        debug!("Registry watch closed, polling only.");
                        watch = None;
                    }
                }
            }
        }
        debug!("Heartbeat task stopped.");
    }

    /// Republishes the local descriptor. Returns its version.
    async fn publish(&self) -> u64 {
        let descriptor = {
            let mut local = self.local.write().await;
            local.heartbeat_at_ms = now_ms();
            local.clone()
        };
        let version = descriptor.version;
        match self.directory.upsert(descriptor).await {
            Ok(()) => {}
            Err(e @ crate::Error::IdConflict(_)) => error!("{}", e),
            Err(e) => warn!("Can not publish descriptor: {}", e),
        }
        version
    }

    async fn refresh(&self) {
        match self.directory.refresh().await {
            Ok(report) => {
                for id in report.discovered {
                    let _ = self.observations.send(Observation::Discovered(id));
                }
                for id in report.departed {
                    let _ = self.observations.send(Observation::Departed(id));
                }
            }
            Err(e) => warn!("Directory refresh failed: {}", e),
        }
    }

    async fn broadcast(&self, version: u64) {
        for entry in self.directory.all().await {
            if entry.is_local() {
                continue;
            }
            let dispatcher = self.dispatcher.clone();
            let limit = self.heartbeat_rate;
            tokio::spawn(async move {
                let address = &entry.descriptor.address;
                match timeout(limit, dispatcher.send_heartbeat(address, version)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Heartbeat to {} failed: {}", entry.id(), e),
                    Err(_) => debug!("Heartbeat to {} timed out.", entry.id()),
                }
            });
        }
    }

    async fn detector_loop(
        self: Arc<Self>,
        mut observations: ObservationReceiver,
        token: CancellationToken,
    ) {
        let mut members: HashMap<String, Member> = HashMap::new();
        loop {
            let deadline = members
                .values()
                .filter_map(|m| m.deadline(self.suspect_after, self.heartbeat_timeout))
                .min();
            select! {
                biased;
                _ = token.cancelled() => break,
                observation = observations.recv() => match observation {
                    Some(observation) => self.observe(&mut members, observation).await,
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => self.check(&mut members).await,
            }
        }
        debug!("Failure detector stopped.");
    }

    async fn observe(&self, members: &mut HashMap<String, Member>, observation: Observation) {
        match observation {
            Observation::Heartbeat { node_id, version } => {
                self.seen(members, node_id, Some(version)).await
            }
            Observation::Traffic(node_id) => self.seen(members, node_id, None).await,
            Observation::Discovered(node_id) => match members.get(&node_id) {
                Some(member) if member.state == MemberState::Dead => {
                    debug!("Record of dead node {} does not revive it.", node_id);
                    self.directory.mark_stale(&node_id).await;
                }
                _ => self.seen(members, node_id, None).await,
            },
            Observation::Departed(node_id) => {
                if let Some(member) = members.get_mut(&node_id) {
                    if member.state == MemberState::Alive {
                        info!("Node {} is suspected, its record is missing.", node_id);
                        member.state = MemberState::Suspected;
                        self.members.set(&node_id, MemberState::Suspected).await;
                    }
                }
            }
            Observation::Left(node_id) => {
                if node_id == self.directory.local_id() {
                    return;
                }
                info!("Node {} left the cluster.", node_id);
                members.remove(&node_id);
                self.members.forget(&node_id).await;
                self.directory.forget(&node_id).await;
                self.dispatcher.fail_node(&node_id).await;
            }
        }
    }

    async fn seen(
        &self,
        members: &mut HashMap<String, Member>,
        id: String,
        version: Option<u64>,
    ) {
        if id == self.directory.local_id() {
            return;
        }
        let now = Instant::now();

        let newer = match members.get_mut(&id) {
            Some(member) => {
                member.last_seen = now;
                if member.state != MemberState::Alive {
                    info!("Node {} is alive again.", id);
                    member.state = MemberState::Alive;
                    member.recheck = None;
                    self.members.set(&id, MemberState::Alive).await;
                }
                match version {
                    Some(version) if version > member.version => {
                        member.version = version;
                        true
                    }
                    _ => false,
                }
            }
            None => {
                debug!("Tracking node {}.", id);
                members.insert(id.clone(), Member::new(now, version.unwrap_or_default()));
                self.members.set(&id, MemberState::Alive).await;
                false
            }
        };

        let known = self.directory.lookup(&id).await.is_some();
        if known {
            self.directory.mark_alive(&id, now).await;
        }
        if !known || newer {
            self.spawn_refresh(id);
        }
    }

    async fn check(&self, members: &mut HashMap<String, Member>) {
        let now = Instant::now();
        let mut dead = Vec::new();
        let mut gone = Vec::new();

        for (id, member) in members.iter_mut() {
            let silence = now.saturating_duration_since(member.last_seen);
            match member.state {
                MemberState::Alive | MemberState::Suspected
                    if silence >= self.heartbeat_timeout =>
                {
                    warn!("Node {} is dead after {:?} of silence.", id, silence);
                    member.state = MemberState::Dead;
                    member.recheck = Some(now + self.heartbeat_timeout);
                    dead.push(id.clone());
                }
                MemberState::Dead if member.recheck.is_some_and(|at| at <= now) => {
                    if self.directory.lookup(id).await.is_some() {
                        member.recheck = Some(now + self.heartbeat_timeout);
                    } else {
                        gone.push(id.clone());
                    }
                }
                MemberState::Alive if silence >= self.suspect_after => {
                    info!("Node {} is suspected.", id);
                    member.state = MemberState::Suspected;
                    self.members.set(id, MemberState::Suspected).await;
                }
                _ => {}
            }
        }

        for id in gone {
            debug!("Forgetting dead node {}.", id);
            members.remove(&id);
            self.members.forget(&id).await;
        }

        for id in dead {
            self.members.set(&id, MemberState::Dead).await;
            self.directory.mark_stale(&id).await;
            self.dispatcher.fail_node(&id).await;

            let directory = self.directory.clone();
            tokio::spawn(async move {
                if let Err(e) = directory.remove(&id).await {
                    warn!("Can not evict node {} from the registry: {}", id, e);
                }
            });
        }
    }

    fn spawn_refresh(&self, id: String) {
        let directory = self.directory.clone();
        let observations = self.observations.clone();
        tokio::spawn(async move {
            match directory.refresh_node(&id).await {
                Ok(true) => {
                    let _ = observations.send(Observation::Discovered(id));
                }
                // The refresh follows a sign of life of the node.
                Ok(false) => {
                    directory.mark_alive(&id, Instant::now()).await;
                }
                Err(e) => warn!("Can not read descriptor of node {}: {}", id, e),
            }
        });
    }
}

async fn next_event(watch: &mut Option<Watch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlines_follow_state() {
        let now = Instant::now();
        let suspect_after = Duration::from_millis(1500);
        let timeout = Duration::from_secs(2);
        let mut member = Member::new(now, 0);
        assert_eq!(member.deadline(suspect_after, timeout), Some(now + suspect_after));

        member.state = MemberState::Suspected;
        assert_eq!(member.deadline(suspect_after, timeout), Some(now + timeout));

        member.state = MemberState::Dead;
        assert_eq!(member.deadline(suspect_after, timeout), None);

        member.recheck = Some(now + timeout * 2);
        assert_eq!(member.deadline(suspect_after, timeout), Some(now + timeout * 2));
    }

    #[tokio::test]
    async fn test_members_view() {
        let members = Members::default();
        members.set("b", MemberState::Alive).await;
        members.set("a", MemberState::Suspected).await;
        members.set("b", MemberState::Dead).await;

        assert_eq!(members.state("b").await, Some(MemberState::Dead));
        assert_eq!(
            members.snapshot().await.into_iter().collect::<Vec<_>>(),
            vec![
                ("a".to_owned(), MemberState::Suspected),
                ("b".to_owned(), MemberState::Dead),
            ]
        );

        members.forget("a").await;
        assert_eq!(members.state("a").await, None);
    }
}
