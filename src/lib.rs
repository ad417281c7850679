// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Distributed actor layer for the Rush framework.
//! Nodes publish the actors they host to a shared registry, watch each other
//! through heartbeats and invoke remote actors through location-transparent
//! proxies. Registry backends are pluggable; the SQLite backend is behind the
//! `sqlite` feature.

pub use cluster::{
    Actor, CorrelationId, DispatcherStats, DirectoryEntry, Envelope,
    Error, Failure, FailureKind, Inbound, InvokeMode, LocalActors,
    LocalInvoker, MemberState, MemoryNetwork, MemoryTransport, Message, Node,
    NodeConfig, NodeDescriptor, NodeReport, Outcome, Payload,
    RemoteActorRef, TcpTransport, Transport, DIAGNOSTICS_ACTOR,
    PROTOCOL_VERSION,
};

pub use registry::{
    Error as RegistryError, MemoryRegistry, RegistryAdapter, Watch, WatchEvent,
};

#[cfg(feature = "sqlite")]
pub use sqlite_db::SqliteRegistry;
