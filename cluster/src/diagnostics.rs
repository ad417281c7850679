// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Diagnostics
//!
//! A read-only actor registered on every node under [`DIAGNOSTICS_ACTOR`].
//! It answers through the ordinary proxy path:
//!
//! | method     | result                                   |
//! |------------|------------------------------------------|
//! | `ping`     | node id (`String`)                       |
//! | `describe` | [`NodeReport`]                           |
//! | `members`  | `BTreeMap<String, MemberState>`          |
//! | `stats`    | [`DispatcherStats`]                      |
//!

use crate::{
    directory::NodeDescriptor,
    dispatcher::DispatcherStats,
    local::Actor,
    membership::MemberState,
    node::NodeInner,
    protocol::{Failure, FailureKind, Payload},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::{collections::BTreeMap, sync::Weak};

/// Name of the diagnostics actor.
pub const DIAGNOSTICS_ACTOR: &str = "$diagnostics";

/// What a node knows about itself and the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub descriptor: NodeDescriptor,
    pub members: BTreeMap<String, MemberState>,
    pub actors: Vec<String>,
    pub stats: DispatcherStats,
}

pub(crate) struct Diagnostics {
    node: Weak<NodeInner>,
}

impl Diagnostics {
    pub fn new(node: Weak<NodeInner>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Actor for Diagnostics {
    async fn handle(&mut self, method: &str, _args: Payload) -> Result<Payload, Failure> {
        let node = self
            .node
            .upgrade()
            .ok_or_else(|| Failure::new(FailureKind::Stopped, "node is gone"))?;

        let result = match method {
            "ping" => Payload::encode(&node.id),
            "describe" => Payload::encode(&node.report().await),
            "members" => Payload::encode(&node.members.snapshot().await),
            "stats" => Payload::encode(&node.dispatcher.stats().await),
            _ => return Err(Failure::method_not_found(method)),
        };
        result.map_err(|e| Failure::method(e.to_string()))
    }
}
