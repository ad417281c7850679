// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # SQLite registry module.
//!
//! This module contains the SQLite registry backend implementation.
//!

mod sqlite;

pub use sqlite::SqliteRegistry;
