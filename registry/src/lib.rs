// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Registry module.
//!
//! Pluggable key/value directory backends for the cluster layer, plus the
//! in-memory reference backend.
//!

pub mod adapter;
pub mod error;
pub mod memory;

pub use adapter::{RegistryAdapter, Watch, WatchEvent};
pub use error::Error;
pub use memory::MemoryRegistry;
