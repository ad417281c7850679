// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Node configuration
//!
//! Settings consumed by a cluster node. Loading them from files or the
//! command line is left to the embedding process; every field has a default
//! so `NodeConfig::default()` yields a working loopback node.
//!

use crate::Error;

use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Cluster-wide node id. Generated when absent.
    pub id: Option<String>,
    /// Address the transport binds to. Port `0` picks a free port.
    pub address: String,
    /// Period of descriptor refresh and heartbeat broadcast.
    pub heartbeat_rate: Duration,
    /// Silence after which a remote node is declared dead.
    pub heartbeat_timeout: Duration,
    /// Capacity of each outbound cast lane and number of inbound casts
    /// running at once.
    pub async_pool_size: usize,
    /// Deadline used by the typed proxy helpers. Also bounds each cast, reply
    /// and TCP write.
    pub call_timeout: Duration,
    /// Period of the pending call timeout sweep.
    pub sweep_interval: Duration,
    /// Attempts made to publish the descriptor while the registry is
    /// unavailable at startup.
    pub registry_retries: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            address: "127.0.0.1:0".to_owned(),
            heartbeat_rate: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            async_pool_size: 50,
            call_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(500),
            registry_retries: 3,
        }
    }
}

impl NodeConfig {
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }

    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_owned();
        self
    }

    /// Sets the heartbeat rate and timeout together.
    pub fn with_heartbeat(mut self, rate: Duration, timeout: Duration) -> Self {
        self.heartbeat_rate = rate;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_async_pool_size(mut self, size: usize) -> Self {
        self.async_pool_size = size;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_registry_retries(mut self, retries: usize) -> Self {
        self.registry_retries = retries;
        self
    }

    /// Silence after which a remote node becomes suspected: halfway between
    /// one missed heartbeat and the timeout.
    pub fn suspect_after(&self) -> Duration {
        (self.heartbeat_rate + self.heartbeat_timeout) / 2
    }

    /// Checks the invariants the membership and dispatcher rely on.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` when a duration is zero, the timeout
    /// does not exceed the rate, or the pool size is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.heartbeat_rate.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat_rate must be greater than zero".to_owned(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_rate {
            return Err(Error::InvalidConfig(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_rate ({:?})",
                self.heartbeat_timeout, self.heartbeat_rate
            )));
        }
        if self.async_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "async_pool_size must be greater than zero".to_owned(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sweep_interval must be greater than zero".to_owned(),
            ));
        }
        if self.id.as_deref().is_some_and(|id| id.is_empty() || id.contains('/')) {
            return Err(Error::InvalidConfig(
                "node id must be non-empty and must not contain '/'".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.address, "127.0.0.1:0");
        assert_eq!(config.heartbeat_rate, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.async_pool_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_must_exceed_rate() {
        let config = NodeConfig::default()
            .with_heartbeat(Duration::from_secs(2), Duration::from_secs(2));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_must_not_be_empty() {
        let config = NodeConfig::default().with_async_pool_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_id_cannot_escape_namespace() {
        let config = NodeConfig::default().with_id("a/b");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_suspect_after_sits_between_rate_and_timeout() {
        let config = NodeConfig::default()
            .with_heartbeat(Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(config.suspect_after(), Duration::from_millis(1500));
    }
}
