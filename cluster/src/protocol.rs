// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Wire protocol
//!
//! Every frame exchanged between nodes is an [`Envelope`] carrying one
//! [`Message`]. Envelopes are encoded with `bincode`, which tags enum
//! variants by position: new variants must only ever be appended, never
//! reordered, so the tags stay stable across versions.
//!
//! Remote failures travel as data ([`Outcome::Failure`]) and are only turned
//! into an [`Error`] at the proxy boundary.
//!

use crate::Error;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use std::fmt::{self, Display};

/// Version stamped on every envelope. Frames with another version are
/// rejected by [`Envelope::decode`].
pub const PROTOCOL_VERSION: u16 = 1;

/// Token linking a `Call` to its `Response`.
///
/// Unique per sending node: the node id plus a monotonic counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId {
    pub node: String,
    pub sequence: u64,
}

impl CorrelationId {
    pub fn new(node: &str, sequence: u64) -> Self {
        Self {
            node: node.to_owned(),
            sequence,
        }
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.sequence)
    }
}

/// Opaque argument or result bytes.
///
/// The cluster layer never looks inside a payload. Typed callers use
/// [`Payload::encode`] and [`Payload::decode`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// An empty payload, used for methods without arguments or results.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serializes `value` into a payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the value cannot be serialized.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, Error> {
        Ok(Self(bincode::serialize(value)?))
    }

    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the bytes are not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(bincode::deserialize(&self.0)?)
    }
}

/// Category of a remote failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The receiving node hosts no actor with the requested name.
    ActorNotFound,
    /// The actor does not understand the requested method.
    MethodNotFound,
    /// The actor handled the method and reported an error.
    MethodError,
    /// The actor panicked while handling the method.
    Panicked,
    /// The actor stopped before answering.
    Stopped,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            FailureKind::ActorNotFound => "actor not found",
            FailureKind::MethodNotFound => "method not found",
            FailureKind::MethodError => "method error",
            FailureKind::Panicked => "panicked",
            FailureKind::Stopped => "stopped",
        };
        f.write_str(kind)
    }
}

/// A remote failure: kind plus the actor's own description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub description: String,
}

impl Failure {
    pub fn new(kind: FailureKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub fn actor_not_found(actor: &str) -> Self {
        Self::new(FailureKind::ActorNotFound, actor)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(FailureKind::MethodNotFound, format!("unknown method {}", method))
    }

    /// Failure reported by an actor's own method.
    pub fn method(description: impl Into<String>) -> Self {
        Self::new(FailureKind::MethodError, description)
    }

    /// Converts the wire failure into the caller-facing error.
    pub fn into_error(self) -> Error {
        match self.kind {
            FailureKind::ActorNotFound => Error::ActorNotFound(self.description),
            kind => Error::RemoteActor {
                kind,
                description: self.description,
            },
        }
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

/// Result of a remote invocation as carried by a `Response`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Payload),
    Failure(Failure),
}

impl Outcome {
    /// Converts the outcome into the caller-facing result.
    pub fn into_result(self) -> Result<Payload, Error> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure.into_error()),
        }
    }
}

impl From<Result<Payload, Failure>> for Outcome {
    fn from(result: Result<Payload, Failure>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(failure) => Outcome::Failure(failure),
        }
    }
}

/// Messages exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Invocation expecting a `Response` sent to `reply_to`.
    Call {
        correlation_id: CorrelationId,
        target_actor: String,
        method: String,
        args: Payload,
        reply_to: String,
    },
    /// Fire-and-forget invocation.
    Cast {
        target_actor: String,
        method: String,
        args: Payload,
    },
    /// Answer to a `Call`.
    Response {
        correlation_id: CorrelationId,
        outcome: Outcome,
    },
    /// Liveness signal. `descriptor_version` lets observers notice that the
    /// sender's advertised actors changed.
    Heartbeat {
        node_id: String,
        descriptor_version: u64,
    },
    /// The sender is shutting down. Its pending calls will not be answered.
    Leave { node_id: String },
}

impl Message {
    /// Short tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::Cast { .. } => "cast",
            Message::Response { .. } => "response",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Leave { .. } => "leave",
        }
    }
}

/// A framed message with its sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    /// Id of the sending node. Any frame counts as a sign of life.
    pub sender: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(sender: &str, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender: sender.to_owned(),
            message,
        }
    }

    /// Encodes the envelope into a frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` on malformed bytes or an unknown protocol
    /// version.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::Codec(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        let id = CorrelationId::new("node-a", 7);
        vec![
            Message::Call {
                correlation_id: id.clone(),
                target_actor: "echo".to_owned(),
                method: "say".to_owned(),
                args: Payload::encode(&"hello").unwrap(),
                reply_to: "127.0.0.1:4000".to_owned(),
            },
            Message::Cast {
                target_actor: "log".to_owned(),
                method: "append".to_owned(),
                args: Payload::empty(),
            },
            Message::Response {
                correlation_id: id.clone(),
                outcome: Outcome::Success(Payload::encode(&42u64).unwrap()),
            },
            Message::Response {
                correlation_id: id,
                outcome: Outcome::Failure(Failure::method("boom")),
            },
            Message::Heartbeat {
                node_id: "node-a".to_owned(),
                descriptor_version: 3,
            },
            Message::Leave {
                node_id: "node-a".to_owned(),
            },
        ]
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        for message in sample_messages() {
            let envelope = Envelope::new("node-a", message);
            let bytes = envelope.encode().unwrap();
            assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
        }
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut envelope = Envelope::new(
            "node-a",
            Message::Heartbeat {
                node_id: "node-a".to_owned(),
                descriptor_version: 1,
            },
        );
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&envelope).unwrap();
        assert!(matches!(Envelope::decode(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(&[0xff, 0x01]),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_failure_conversion() {
        assert_eq!(
            Failure::actor_not_found("ghost").into_error(),
            Error::ActorNotFound("ghost".to_owned())
        );
        assert_eq!(
            Outcome::Failure(Failure::method("bad input")).into_result(),
            Err(Error::RemoteActor {
                kind: FailureKind::MethodError,
                description: "bad input".to_owned()
            })
        );
    }

    #[test]
    fn test_typed_payload() {
        let payload = Payload::encode(&(1u32, "two".to_owned())).unwrap();
        let decoded: (u32, String) = payload.decode().unwrap();
        assert_eq!(decoded, (1, "two".to_owned()));
        assert!(payload.decode::<Vec<u64>>().is_err());
    }

    #[test]
    fn test_correlation_id_display() {
        assert_eq!(CorrelationId::new("a", 12).to_string(), "a#12");
    }
}
