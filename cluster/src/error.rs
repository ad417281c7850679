// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use crate::protocol::FailureKind;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the cluster layer.
///
/// `call` failures are always one of `Timeout`, `NodeUnreachable`,
/// `RemoteActor` or `ActorNotFound`, so callers can tell "the remote actor
/// said no" apart from "nobody answered".
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The registry backend could not be reached. Transient.
    #[error("Registry unavailable: {0}.")]
    RegistryUnavailable(String),
    /// Another live process already published this node id.
    #[error("Node id {0} is already published by another process.")]
    IdConflict(String),
    /// The target node is known to be dead or its address cannot be reached.
    #[error("Node {0} is unreachable.")]
    NodeUnreachable(String),
    /// No response arrived before the call deadline.
    #[error("Call {0} timed out.")]
    Timeout(String),
    /// The remote actor failed while handling the call.
    #[error("Remote actor error ({kind}): {description}")]
    RemoteActor {
        kind: FailureKind,
        description: String,
    },
    /// The local outbound pool is saturated.
    #[error("Outbound pool is saturated.")]
    Overloaded,
    /// The remote dispatcher has no actor with this name.
    #[error("Actor {0} not found.")]
    ActorNotFound(String),
    /// An actor with this name is already registered on this node.
    #[error("Actor {0} already exists.")]
    ActorExists(String),
    /// A frame or payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
    /// The transport could not deliver a frame.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The node configuration is not usable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The node is shutting down.
    #[error("Node is shutting down.")]
    Shutdown,
}

impl From<registry::Error> for Error {
    fn from(error: registry::Error) -> Self {
        match error {
            registry::Error::Unavailable(reason)
            | registry::Error::CreateRegistry(reason) => {
                Error::RegistryUnavailable(reason)
            }
            registry::Error::Conflict(key) => Error::IdConflict(key),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Codec(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_mapping() {
        assert_eq!(
            Error::from(registry::Error::Unavailable("down".to_owned())),
            Error::RegistryUnavailable("down".to_owned())
        );
        assert_eq!(
            Error::from(registry::Error::Conflict("nodes/a".to_owned())),
            Error::IdConflict("nodes/a".to_owned())
        );
    }

    #[test]
    fn test_remote_error_display() {
        let error = Error::RemoteActor {
            kind: FailureKind::MethodError,
            description: "division by zero".to_owned(),
        };
        assert_eq!(
            error.to_string(),
            "Remote actor error (method error): division by zero"
        );
    }
}
