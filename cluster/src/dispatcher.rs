// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailbox dispatcher
//!
//! The single point through which all wire traffic of a node passes.
//!
//! ## Outbound
//!
//! - [`Dispatcher::send_call`] allocates a [`CorrelationId`], registers a
//!   pending call with its deadline and transmits the `Call`. Transmission
//!   is raced against the deadline, so a stalled peer cannot hold the caller
//!   past it. The returned [`PendingReply`] resolves exactly once.
//! - [`Dispatcher::send_cast`] queues the `Cast` on the lane of its target
//!   address: a bounded queue of `async_pool_size` frames drained by a
//!   worker task of its own. A full lane yields `Error::Overloaded`. A peer
//!   that stops reading only blocks its own lane.
//! - [`Dispatcher::send_heartbeat`] and [`Dispatcher::send_leave`] bypass
//!   the lanes.
//!
//! ## Inbound
//!
//! Frames are decoded and routed by tag. Calls run on their own task and
//! answer `reply_to`; casts wait for one of `async_pool_size` permits before
//! running, so at most that many run at once and none is dropped;
//! responses complete their pending call; heartbeats, leaves and every
//! sender id are forwarded to the membership manager. The inbound path never
//! touches the registry.
//!
//! ## Pending calls
//!
//! A pending call leaves the table under its lock, and only the code that
//! removed it completes it. Response arrival, deadline expiry (from the
//! waiter, the sender or the periodic sweep), node death and shutdown all go
//! through that removal, so each call resolves at most once.
//!
//! A call that times out locally may still run on the remote node: there is
//! no cancel message. Delivery is at-most-once; effects are not exactly-once.
//!

use crate::{
    local::LocalInvoker,
    membership::{Observation, ObservationSender},
    protocol::{CorrelationId, Envelope, Failure, FailureKind, Message, Outcome, Payload},
    transport::{Inbound, Transport},
    Error, NodeConfig,
};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::{
    select,
    sync::{mpsc, oneshot, Mutex, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

type Completion = oneshot::Sender<Result<Outcome, Error>>;

/// Bookkeeping of a call awaiting its response.
struct PendingCall {
    node_id: String,
    deadline: Instant,
    completion: Completion,
}

/// Sending side of the cast lane of one address.
type Lane = mpsc::Sender<Vec<u8>>;

/// Counters exposed by [`Dispatcher::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub calls_sent: u64,
    pub calls_served: u64,
    pub casts_sent: u64,
    pub casts_served: u64,
    /// Outbound casts refused because their lane was full.
    pub overloaded_casts: u64,
    pub timeouts: u64,
    /// Pending calls failed because their node died or left.
    pub unreachable: u64,
    /// Responses with no pending call.
    pub discarded_responses: u64,
    /// Calls currently awaiting a response.
    pub pending: u64,
}

#[derive(Default)]
struct Counters {
    calls_sent: AtomicU64,
    calls_served: AtomicU64,
    casts_sent: AtomicU64,
    casts_served: AtomicU64,
    overloaded_casts: AtomicU64,
    timeouts: AtomicU64,
    unreachable: AtomicU64,
    discarded_responses: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Mailbox dispatcher of one node.
pub struct Dispatcher {
    node_id: String,
    address: String,
    transport: Arc<dyn Transport>,
    invoker: Arc<dyn LocalInvoker>,
    pending: Mutex<HashMap<CorrelationId, PendingCall>>,
    sequence: AtomicU64,
    lanes: std::sync::Mutex<HashMap<String, Lane>>,
    lane_capacity: usize,
    inbound_casts: Arc<Semaphore>,
    observations: ObservationSender,
    counters: Counters,
    /// Bound on a single outbound cast, reply or leave transmission.
    send_timeout: Duration,
    /// A lane with nothing to send for this long stops its worker.
    lane_idle: Duration,
    sweep_interval: Duration,
    token: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher, to be started with [`Dispatcher::start`].
    pub(crate) fn new(
        node_id: &str,
        config: &NodeConfig,
        transport: Arc<dyn Transport>,
        invoker: Arc<dyn LocalInvoker>,
        observations: ObservationSender,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.to_owned(),
            address: transport.local_address(),
            transport,
            invoker,
            pending: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            lanes: std::sync::Mutex::new(HashMap::new()),
            lane_capacity: config.async_pool_size,
            inbound_casts: Arc::new(Semaphore::new(config.async_pool_size)),
            observations,
            counters: Counters::default(),
            send_timeout: config.call_timeout,
            lane_idle: config.heartbeat_timeout,
            sweep_interval: config.sweep_interval,
            token,
        })
    }

    /// Spawns the inbound loop and the timeout sweep.
    pub(crate) fn start(self: &Arc<Self>, inbound: Inbound) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().inbound_loop(inbound)),
            tokio::spawn(self.clone().sweep_loop()),
        ]
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Sends a `Call` and registers its pending entry.
    ///
    /// If the transport has not taken the frame by the deadline the call is
    /// expired and the returned reply resolves with `Error::Timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NodeUnreachable` if the transport refuses the frame,
    /// `Error::Shutdown` once the node is stopping.
    pub async fn send_call(
        self: &Arc<Self>,
        node_id: &str,
        address: &str,
        target_actor: &str,
        method: &str,
        args: Payload,
        timeout: Duration,
    ) -> Result<PendingReply, Error> {
        if self.token.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let id = CorrelationId::new(
            &self.node_id,
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        let frame = Envelope::new(
            &self.node_id,
            Message::Call {
                correlation_id: id.clone(),
                target_actor: target_actor.to_owned(),
                method: method.to_owned(),
                args,
                reply_to: self.address.clone(),
            },
        )
        .encode()?;

        let (completion, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.pending.lock().await.insert(
            id.clone(),
            PendingCall {
                node_id: node_id.to_owned(),
                deadline,
                completion,
            },
        );

        let sent = select! {
            result = self.transport.send(address, frame) => Some(result),
            _ = sleep_until(deadline) => None,
        };
        match sent {
            Some(Ok(())) => {
                bump(&self.counters.calls_sent);
                debug!("Call {} sent to {}@{}.", id, target_actor, node_id);
            }
            Some(Err(e)) => {
                warn!("Can not send call {} to node {}: {}", id, node_id, e);
                self.pending.lock().await.remove(&id);
                return Err(Error::NodeUnreachable(node_id.to_owned()));
            }
            None => {
                warn!("Call {} to node {} was not sent before its deadline.", id, node_id);
                self.expire(&id).await;
            }
        }

        Ok(PendingReply {
            id,
            deadline,
            receiver,
            dispatcher: self.clone(),
        })
    }

    /// Queues a `Cast` on the lane of `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Overloaded` when the lane is full and
    /// `Error::Shutdown` once the node is stopping.
    pub fn send_cast(
        &self,
        address: &str,
        target_actor: &str,
        method: &str,
        args: Payload,
    ) -> Result<(), Error> {
        if self.token.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let frame = Envelope::new(
            &self.node_id,
            Message::Cast {
                target_actor: target_actor.to_owned(),
                method: method.to_owned(),
                args,
            },
        )
        .encode()?;

        // A lane that went idle and closed is replaced once.
        let mut frame = frame;
        for _ in 0..2 {
            match self.lane(address)?.try_send(frame) {
                Ok(()) => {
                    bump(&self.counters.casts_sent);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    bump(&self.counters.overloaded_casts);
                    warn!(
                        "Cast lane to {} is full, refusing {}.{}.",
                        address, target_actor, method
                    );
                    return Err(Error::Overloaded);
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => frame = returned,
            }
        }
        Err(Error::Shutdown)
    }

    /// The open lane of `address`, created on first use.
    fn lane(&self, address: &str) -> Result<Lane, Error> {
        let mut lanes = self
            .lanes
            .lock()
            .map_err(|e| Error::Transport(format!("Can not lock cast lanes: {}", e)))?;
        if let Some(lane) = lanes.get(address).filter(|lane| !lane.is_closed()) {
            return Ok(lane.clone());
        }
        lanes.retain(|_, lane| !lane.is_closed());
        let lane = self.open_lane(address);
        lanes.insert(address.to_owned(), lane.clone());
        Ok(lane)
    }

    fn open_lane(&self, address: &str) -> Lane {
        let (lane, frames) = mpsc::channel(self.lane_capacity);
        tokio::spawn(cast_lane(
            self.transport.clone(),
            address.to_owned(),
            frames,
            self.send_timeout,
            self.lane_idle,
            self.token.clone(),
        ));
        lane
    }

    /// Sends a `Heartbeat` straight to the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport error.
    pub async fn send_heartbeat(&self, address: &str, version: u64) -> Result<(), Error> {
        let frame = Envelope::new(
            &self.node_id,
            Message::Heartbeat {
                node_id: self.node_id.clone(),
                descriptor_version: version,
            },
        )
        .encode()?;
        self.transport.send(address, frame).await
    }

    /// Tells the node at `address` that this node is leaving.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or `Error::Transport` if the frame is not
    /// taken in time.
    pub async fn send_leave(&self, address: &str) -> Result<(), Error> {
        let frame = Envelope::new(
            &self.node_id,
            Message::Leave {
                node_id: self.node_id.clone(),
            },
        )
        .encode()?;
        timeout(self.send_timeout, self.transport.send(address, frame))
            .await
            .map_err(|_| Error::Transport(format!("leave to {} timed out", address)))?
    }

    /// Fails every pending call addressed to `node_id` with
    /// `Error::NodeUnreachable`.
    pub async fn fail_node(&self, node_id: &str) {
        let mut pending = self.pending.lock().await;
        let ids: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, call)| call.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(call) = pending.remove(&id) {
                bump(&self.counters.unreachable);
                let _ = call
                    .completion
                    .send(Err(Error::NodeUnreachable(node_id.to_owned())));
            }
        }
    }

    /// Fails every pending call with `error`.
    pub async fn fail_all(&self, error: Error) {
        let drained: Vec<PendingCall> =
            self.pending.lock().await.drain().map(|(_, call)| call).collect();
        for call in drained {
            let _ = call.completion.send(Err(error.clone()));
        }
    }

    /// Completes the pending call `id` with `Error::Timeout` if it is still
    /// pending.
    async fn expire(&self, id: &CorrelationId) {
        if let Some(call) = self.pending.lock().await.remove(id) {
            bump(&self.counters.timeouts);
            debug!("Call {} timed out.", id);
            let _ = call.completion.send(Err(Error::Timeout(id.to_string())));
        }
    }

    /// Completes the pending call `id` with the remote outcome.
    async fn complete(&self, id: CorrelationId, outcome: Outcome) {
        match self.pending.lock().await.remove(&id) {
            Some(call) => {
                if call.completion.send(Ok(outcome)).is_err() {
                    debug!("Caller of {} is gone.", id);
                }
            }
            None => {
                bump(&self.counters.discarded_responses);
                debug!("Discarding response to unknown call {}.", id);
            }
        }
    }

    pub async fn pending_calls(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn stats(&self) -> DispatcherStats {
        let counters = &self.counters;
        DispatcherStats {
            calls_sent: counters.calls_sent.load(Ordering::Relaxed),
            calls_served: counters.calls_served.load(Ordering::Relaxed),
            casts_sent: counters.casts_sent.load(Ordering::Relaxed),
            casts_served: counters.casts_served.load(Ordering::Relaxed),
            overloaded_casts: counters.overloaded_casts.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            unreachable: counters.unreachable.load(Ordering::Relaxed),
            discarded_responses: counters.discarded_responses.load(Ordering::Relaxed),
            pending: self.pending_calls().await as u64,
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut inbound: Inbound) {
        loop {
            select! {
                _ = self.token.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(&frame).await,
                    None => break,
                }
            }
        }
        debug!("Inbound loop of {} stopped.", self.node_id);
    }

    async fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let Envelope { sender, message, .. } = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };
        debug!("Received {} from {}.", message.kind(), sender);

        match message {
            Message::Call {
                correlation_id,
                target_actor,
                method,
                args,
                reply_to,
            } => {
                self.observe(Observation::Traffic(sender));
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let outcome = dispatcher.invoke(&target_actor, &method, args).await;
                    bump(&dispatcher.counters.calls_served);
                    dispatcher.reply(&reply_to, correlation_id, outcome.into()).await;
                });
            }
            Message::Cast {
                target_actor,
                method,
                args,
            } => {
                self.observe(Observation::Traffic(sender));
                let permits = self.inbound_casts.clone();
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    if let Err(failure) = dispatcher.invoke(&target_actor, &method, args).await {
                        warn!("Cast {}.{} failed: {}", target_actor, method, failure);
                    }
                    bump(&dispatcher.counters.casts_served);
                });
            }
            Message::Response {
                correlation_id,
                outcome,
            } => {
                self.observe(Observation::Traffic(sender));
                self.complete(correlation_id, outcome).await;
            }
            Message::Heartbeat {
                node_id,
                descriptor_version,
            } => self.observe(Observation::Heartbeat {
                node_id,
                version: descriptor_version,
            }),
            Message::Leave { node_id } => self.observe(Observation::Left(node_id)),
        }
    }

    fn observe(&self, observation: Observation) {
        if self.observations.send(observation).is_err() {
            debug!("Membership is gone, dropping observation.");
        }
    }

    /// Runs a local invocation, containing any panic of the invoker.
    async fn invoke(&self, actor: &str, method: &str, args: Payload) -> Result<Payload, Failure> {
        AssertUnwindSafe(self.invoker.invoke_local(actor, method, args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!("Invocation of {}.{} panicked.", actor, method);
                Err(Failure::new(FailureKind::Panicked, "invocation panicked"))
            })
    }

    async fn reply(&self, reply_to: &str, id: CorrelationId, outcome: Outcome) {
        let frame = match Envelope::new(
            &self.node_id,
            Message::Response {
                correlation_id: id.clone(),
                outcome,
            },
        )
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                error!("Can not encode response to {}: {}", id, e);
                return;
            }
        };
        match timeout(self.send_timeout, self.transport.send(reply_to, frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Can not answer call {} at {}: {}", id, reply_to, e),
            Err(_) => warn!("Answer to call {} at {} timed out.", id, reply_to),
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Expires every pending call past its deadline.
    async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, PendingCall)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        for (id, call) in expired {
            bump(&self.counters.timeouts);
            debug!("Call {} expired in sweep.", id);
            let _ = call.completion.send(Err(Error::Timeout(id.to_string())));
        }
    }
}

/// Drains the cast lane of one address. Each frame gets at most
/// `send_timeout`; the worker exits after `idle` without frames.
async fn cast_lane(
    transport: Arc<dyn Transport>,
    address: String,
    mut frames: mpsc::Receiver<Vec<u8>>,
    send_timeout: Duration,
    idle: Duration,
    token: CancellationToken,
) {
    loop {
        select! {
            _ = token.cancelled() => {
                frames.close();
                break;
            }
            _ = sleep(idle) => {
                // Frames queued before the close are still delivered.
                frames.close();
                while let Some(frame) = frames.recv().await {
                    send_cast_frame(transport.as_ref(), &address, frame, send_timeout).await;
                }
                break;
            }
            next = frames.recv() => match next {
                Some(frame) => {
                    send_cast_frame(transport.as_ref(), &address, frame, send_timeout).await;
                }
                None => break,
            }
        }
    }
    debug!("Cast lane to {} closed.", address);
}

async fn send_cast_frame(
    transport: &dyn Transport,
    address: &str,
    frame: Vec<u8>,
    send_timeout: Duration,
) {
    match timeout(send_timeout, transport.send(address, frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Cast to {} was not sent: {}", address, e),
        Err(_) => warn!("Cast to {} timed out in the transport.", address),
    }
}

/// Completion handle of a sent call.
pub struct PendingReply {
    id: CorrelationId,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<Outcome, Error>>,
    dispatcher: Arc<Dispatcher>,
}

impl PendingReply {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits for the outcome of the call.
    ///
    /// Resolves with the response, or with `Error::Timeout` at the deadline,
    /// `Error::NodeUnreachable` when the node dies or leaves first, or
    /// `Error::Shutdown` when the node stops. The remote outcome is returned
    /// as is; converting a failure into an error is left to the proxy.
    pub async fn wait(self) -> Result<Outcome, Error> {
        let PendingReply {
            id,
            deadline,
            mut receiver,
            dispatcher,
        } = self;

        select! {
            result = &mut receiver => result.unwrap_or(Err(Error::Shutdown)),
            _ = sleep_until(deadline) => {
                dispatcher.expire(&id).await;
                receiver.await.unwrap_or(Err(Error::Shutdown))
            }
        }
    }
}
