// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Rush cluster
//!
//! Location-transparent actors across processes. Each process runs a
//! [`Node`] that publishes a [`NodeDescriptor`] (address plus advertised
//! actor names) to a pluggable registry, tracks the liveness of the other
//! nodes through heartbeats, and turns actor names into [`RemoteActorRef`]
//! proxies whose invocations travel as [`Message`]s over a [`Transport`].
//!
//! ## Components
//!
//! - [`protocol`]: wire envelope, messages and payloads.
//! - [`directory`]: cached view of the `nodes/<id>` registry namespace.
//! - [`membership`]: heartbeat publish and failure detection
//!   (`Alive → Suspected → Dead`).
//! - [`dispatcher`]: inbound routing, pending call correlation, timeouts
//!   and cast back-pressure.
//! - [`proxy`]: [`RemoteActorRef`], the client-side stub.
//! - [`node`]: the facade (`find`, `resolve_one`, actor registration,
//!   shutdown).
//! - [`local`]: mailboxes of the actors hosted by a node.
//! - [`diagnostics`]: the built-in introspection actor.
//! - [`transport`]: in-process and TCP transports.
//!
//! ## Guarantees
//!
//! Every call resolves exactly once: with its response, a timeout, a
//! `NodeUnreachable` failure when the target dies, or `Shutdown`. Remote
//! failures surface as [`Error::RemoteActor`] or [`Error::ActorNotFound`],
//! distinct from [`Error::Timeout`] and [`Error::NodeUnreachable`].
//! Delivery is at-most-once per attempt; a call that timed out locally may
//! still have run remotely.
//!

mod config;
pub mod diagnostics;
pub mod directory;
pub mod dispatcher;
mod error;
pub mod local;
pub mod membership;
pub mod node;
pub mod protocol;
pub mod proxy;
pub mod transport;

pub use config::NodeConfig;
pub use diagnostics::{NodeReport, DIAGNOSTICS_ACTOR};
pub use directory::{Directory, DirectoryEntry, NodeDescriptor};
pub use dispatcher::{Dispatcher, DispatcherStats, PendingReply};
pub use error::Error;
pub use local::{Actor, LocalActors, LocalInvoker};
pub use membership::{MemberState, Members};
pub use node::Node;
pub use protocol::{
    CorrelationId, Envelope, Failure, FailureKind, Message, Outcome, Payload,
    PROTOCOL_VERSION,
};
pub use proxy::{InvokeMode, RemoteActorRef};
pub use transport::{Inbound, MemoryNetwork, MemoryTransport, TcpTransport, Transport};
