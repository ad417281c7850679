// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Local actors
//!
//! The execution capability the dispatcher relies on: "invoke method with
//! args on local actor X". Each actor runs on its own task and drains its
//! own mailbox, so the invocations it receives are processed one at a time
//! and in arrival order.
//!
//! A panic inside [`Actor::handle`] is caught at the mailbox boundary and
//! answered with a [`FailureKind::Panicked`] failure. The actor keeps
//! processing its mailbox afterwards.
//!

use crate::{
    protocol::{Failure, FailureKind, Payload},
    Error,
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    select,
    sync::{mpsc, oneshot, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error};

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

/// A named unit of message-ordered computation.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Called once before the actor receives its first invocation.
    ///
    /// # Errors
    ///
    /// An error aborts the registration of the actor.
    async fn pre_start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Handles one invocation.
    ///
    /// Unknown methods should answer [`Failure::method_not_found`].
    async fn handle(&mut self, method: &str, args: Payload) -> Result<Payload, Failure>;

    /// Called once after the mailbox is closed.
    async fn post_stop(&mut self) {}
}

/// Capability consumed by the dispatcher to run invocations locally.
#[async_trait]
pub trait LocalInvoker: Send + Sync + 'static {
    /// Invokes `method` on the local actor named `actor`.
    ///
    /// Fails with [`FailureKind::ActorNotFound`] when no such actor exists.
    async fn invoke_local(
        &self,
        actor: &str,
        method: &str,
        args: Payload,
    ) -> Result<Payload, Failure>;
}

/// An invocation waiting in an actor mailbox.
struct Invocation {
    method: String,
    args: Payload,
    rsvp: oneshot::Sender<Result<Payload, Failure>>,
}

type MailboxSender = mpsc::UnboundedSender<Invocation>;
type MailboxReceiver = mpsc::UnboundedReceiver<Invocation>;

struct ActorHandle {
    sender: MailboxSender,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The actors hosted by one node.
#[derive(Clone, Default)]
pub struct LocalActors {
    actors: Arc<RwLock<HashMap<String, ActorHandle>>>,
}

impl LocalActors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `actor` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ActorExists` if the name is taken, or the error
    /// returned by [`Actor::pre_start`].
    pub async fn spawn<A: Actor>(&self, name: &str, mut actor: A) -> Result<(), Error> {
        if self.contains(name).await {
            return Err(Error::ActorExists(name.to_owned()));
        }

        actor.pre_start().await?;

        let mut actors = self.actors.write().await;
        if actors.contains_key(name) {
            return Err(Error::ActorExists(name.to_owned()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(run(name.to_owned(), actor, receiver, token.clone()));
        actors.insert(
            name.to_owned(),
            ActorHandle {
                sender,
                token,
                task,
            },
        );
        debug!("Local actor {} started.", name);
        Ok(())
    }

    /// Stops the actor named `name` and waits for its `post_stop`.
    ///
    /// Invocations still queued in its mailbox are answered with
    /// [`FailureKind::Stopped`]. Returns `false` if no such actor exists.
    pub async fn stop(&self, name: &str) -> bool {
        let handle = self.actors.write().await.remove(name);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                if let Err(e) = handle.task.await {
                    error!("Local actor {} task failed: {}", name, e);
                }
                debug!("Local actor {} stopped.", name);
                true
            }
            None => false,
        }
    }

    /// Stops every actor.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, ActorHandle)> =
            self.actors.write().await.drain().collect();
        for (name, handle) in handles {
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                error!("Local actor {} task failed: {}", name, e);
            }
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.actors.read().await.contains_key(name)
    }

    /// Names of the running actors, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.actors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl LocalInvoker for LocalActors {
    async fn invoke_local(
        &self,
        actor: &str,
        method: &str,
        args: Payload,
    ) -> Result<Payload, Failure> {
        let sender = self
            .actors
            .read()
            .await
            .get(actor)
            .map(|handle| handle.sender.clone())
            .ok_or_else(|| Failure::actor_not_found(actor))?;

        let (rsvp, response) = oneshot::channel();
        let invocation = Invocation {
            method: method.to_owned(),
            args,
            rsvp,
        };
        if sender.send(invocation).is_err() {
            return Err(Failure::new(
                FailureKind::Stopped,
                format!("actor {} is stopped", actor),
            ));
        }

        response.await.unwrap_or_else(|_| {
            Err(Failure::new(
                FailureKind::Stopped,
                format!("actor {} stopped before answering", actor),
            ))
        })
    }
}

async fn run<A: Actor>(
    name: String,
    mut actor: A,
    mut mailbox: MailboxReceiver,
    token: CancellationToken,
) {
    loop {
        select! {
            biased;
            _ = token.cancelled() => break,
            invocation = mailbox.recv() => {
                let Some(Invocation { method, args, rsvp }) = invocation else {
                    break;
                };
                let result = AssertUnwindSafe(actor.handle(&method, args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let description = panic_message(panic.as_ref());
                        error!(
                            "Local actor {} panicked in {}: {}",
                            name, method, description
                        );
                        Err(Failure::new(FailureKind::Panicked, description))
                    });
                if rsvp.send(result).is_err() {
                    debug!("Caller of {}.{} is gone.", name, method);
                }
            }
        }
    }
    mailbox.close();
    actor.post_stop().await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    struct Counter {
        value: u64,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Actor for Counter {
        async fn handle(&mut self, method: &str, args: Payload) -> Result<Payload, Failure> {
            match method {
                "add" => {
                    let amount: u64 = args
                        .decode()
                        .map_err(|e| Failure::method(e.to_string()))?;
                    self.value += amount;
                    Payload::encode(&self.value).map_err(|e| Failure::method(e.to_string()))
                }
                "explode" => panic!("counter exploded"),
                _ => Err(Failure::method_not_found(method)),
            }
        }

        async fn post_stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn counter() -> (Counter, Arc<AtomicBool>) {
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Counter {
                value: 0,
                stopped: stopped.clone(),
            },
            stopped,
        )
    }

    #[tokio::test]
    async fn test_invocations_are_ordered() {
        let actors = LocalActors::new();
        let (actor, _) = counter();
        actors.spawn("counter", actor).await.unwrap();

        for expected in 1..=5u64 {
            let result = actors
                .invoke_local("counter", "add", Payload::encode(&1u64).unwrap())
                .await
                .unwrap();
            assert_eq!(result.decode::<u64>().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_actor_and_method() {
        let actors = LocalActors::new();
        let (actor, _) = counter();
        actors.spawn("counter", actor).await.unwrap();

        let missing = actors
            .invoke_local("ghost", "add", Payload::empty())
            .await
            .unwrap_err();
        assert_eq!(missing.kind, FailureKind::ActorNotFound);

        let unknown = actors
            .invoke_local("counter", "subtract", Payload::empty())
            .await
            .unwrap_err();
        assert_eq!(unknown.kind, FailureKind::MethodNotFound);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let actors = LocalActors::new();
        let (actor, _) = counter();
        actors.spawn("counter", actor).await.unwrap();

        let failure = actors
            .invoke_local("counter", "explode", Payload::empty())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Panicked);
        assert_eq!(failure.description, "counter exploded");

        let result = actors
            .invoke_local("counter", "add", Payload::encode(&2u64).unwrap())
            .await
            .unwrap();
        assert_eq!(result.decode::<u64>().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_name() {
        let actors = LocalActors::new();
        let (first, _) = counter();
        let (second, _) = counter();
        actors.spawn("counter", first).await.unwrap();
        assert_eq!(
            actors.spawn("counter", second).await,
            Err(Error::ActorExists("counter".to_owned()))
        );
    }

    #[tokio::test]
    async fn test_stop_runs_post_stop() {
        let actors = LocalActors::new();
        let (actor, stopped) = counter();
        actors.spawn("counter", actor).await.unwrap();
        assert_eq!(actors.names().await, vec!["counter".to_owned()]);

        assert!(actors.stop("counter").await);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!actors.stop("counter").await);
        assert!(actors.names().await.is_empty());

        let failure = actors
            .invoke_local("counter", "add", Payload::empty())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ActorNotFound);
    }
}
