// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Remote actor proxy
//!
//! [`RemoteActorRef`] is an immutable binding of node id, address and actor
//! name. Invocations go through the node's dispatcher; remote failures
//! become errors here and nowhere earlier.
//!

use crate::{
    directory::Directory,
    dispatcher::Dispatcher,
    protocol::Payload,
    Error,
};

use serde::{de::DeserializeOwned, Serialize};

use tracing::{debug, warn};

use std::{fmt, sync::Arc, time::Duration};

/// How an invocation is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvokeMode {
    /// Wait for the result, at most `timeout`.
    Call { timeout: Duration },
    /// Fire and forget.
    Cast,
}

/// Client-side stub of an actor hosted by some node.
#[derive(Clone)]
pub struct RemoteActorRef {
    node_id: String,
    address: String,
    actor: String,
    call_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
    directory: Arc<Directory>,
}

impl fmt::Debug for RemoteActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteActorRef")
            .field("node_id", &self.node_id)
            .field("address", &self.address)
            .field("actor", &self.actor)
            .finish()
    }
}

impl RemoteActorRef {
    pub(crate) fn new(
        node_id: &str,
        address: &str,
        actor: &str,
        call_timeout: Duration,
        dispatcher: Arc<Dispatcher>,
        directory: Arc<Directory>,
    ) -> Self {
        Self {
            node_id: node_id.to_owned(),
            address: address.to_owned(),
            actor: actor.to_owned(),
            call_timeout,
            dispatcher,
            directory,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Untyped entry point. Returns `Some(result)` for calls and `None` for
    /// casts.
    ///
    /// # Errors
    ///
    /// See [`RemoteActorRef::call`] and [`RemoteActorRef::cast`].
    pub async fn invoke(
        &self,
        method: &str,
        args: Payload,
        mode: InvokeMode,
    ) -> Result<Option<Payload>, Error> {
        match mode {
            InvokeMode::Call { timeout } => self.call(method, args, timeout).await.map(Some),
            InvokeMode::Cast => self.cast(method, args).await.map(|_| None),
        }
    }

    /// Invokes `method` and waits for its result.
    ///
    /// # Errors
    ///
    /// - `Error::NodeUnreachable` if the node is dead or absent from the
    ///   directory (nothing is sent), or dies before answering.
    /// - `Error::Timeout` if no response arrives within `timeout`.
    /// - `Error::ActorNotFound` if the node hosts no such actor.
    /// - `Error::RemoteActor` if the actor failed.
    pub async fn call(
        &self,
        method: &str,
        args: Payload,
        timeout: Duration,
    ) -> Result<Payload, Error> {
        if !self.node_alive().await {
            debug!(
                "Not calling {}.{} on dead node {}.",
                self.actor, method, self.node_id
            );
            return Err(Error::NodeUnreachable(self.node_id.clone()));
        }

        let reply = self
            .dispatcher
            .send_call(&self.node_id, &self.address, &self.actor, method, args, timeout)
            .await?;
        reply.wait().await?.into_result()
    }

    /// Invokes `method` without waiting.
    ///
    /// Casts to a dead node are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Overloaded` when the cast lane to the node is full.
    pub async fn cast(&self, method: &str, args: Payload) -> Result<(), Error> {
        if !self.node_alive().await {
            warn!(
                "Dropping cast {}.{} to dead node {}.",
                self.actor, method, self.node_id
            );
            return Ok(());
        }
        self.dispatcher
            .send_cast(&self.address, &self.actor, method, args)
    }

    /// Typed call with the node's default call timeout.
    ///
    /// # Errors
    ///
    /// As [`RemoteActorRef::call`], plus `Error::Codec` when the arguments
    /// or the result do not (de)serialize.
    pub async fn ask<A, R>(&self, method: &str, args: &A) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.ask_timeout(method, args, self.call_timeout).await
    }

    /// Typed call with an explicit timeout.
    ///
    /// # Errors
    ///
    /// As [`RemoteActorRef::ask`].
    pub async fn ask_timeout<A, R>(
        &self,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let result = self.call(method, Payload::encode(args)?, timeout).await?;
        result.decode()
    }

    /// Typed cast.
    ///
    /// # Errors
    ///
    /// As [`RemoteActorRef::cast`], plus `Error::Codec`.
    pub async fn tell<A: Serialize>(&self, method: &str, args: &A) -> Result<(), Error> {
        self.cast(method, Payload::encode(args)?).await
    }

    async fn node_alive(&self) -> bool {
        self.directory
            .lookup(&self.node_id)
            .await
            .is_some_and(|entry| entry.alive)
    }
}
