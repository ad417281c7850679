// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Transport
//!
//! The message bus capability the dispatcher runs on: send a frame to an
//! address, receive frames from any sender. Framing and connection handling
//! belong to the implementations; the dispatcher only sees whole frames.
//!
//! Two implementations are provided:
//!
//! - [`MemoryNetwork`]: an in-process bus, used by tests and by clusters that
//!   live inside one process. It can partition addresses to model network
//!   failures.
//! - [`TcpTransport`]: length-delimited frames over tokio TCP streams.
//!

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpTransport, MAX_FRAME_LENGTH};

use crate::Error;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Frames received by a bound transport.
pub type Inbound = mpsc::Receiver<Vec<u8>>;

/// Capacity of the inbound frame channel of every transport.
pub(crate) const INBOUND_CAPACITY: usize = 1024;

/// Outbound side of a bound transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address other nodes use to reach this transport.
    fn local_address(&self) -> String;

    /// Sends one frame to `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transport` when the frame cannot be handed to the
    /// network. Success does not mean the frame was delivered.
    async fn send(&self, address: &str, frame: Vec<u8>) -> Result<(), Error>;

    /// Stops accepting frames. Pending inbound frames may be lost.
    async fn close(&self) {}
}
