// SPDX-License-Identifier: AGPL-3.0-or-later
// JaalDB - Distributed Caching Object Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Configuration for the caching data store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JaalError, Result};

/// The smallest allowed cache size. The binding-search protocol needs
/// headroom for provisional entries, so tiny caches are rejected outright.
pub const MIN_CACHE_SIZE: usize = 1000;

/// When to run internal binding consistency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckBindings {
    /// Never check. The default.
    #[default]
    None,
    /// Check after every binding operation and at the end of every
    /// transaction.
    Operation,
    /// Check only at the end of every transaction.
    Txn,
}

/// The point at which a consistency check is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    Operation,
    Txn,
}

impl CheckBindings {
    pub fn should_check(self, at: CheckLevel) -> bool {
        match self {
            CheckBindings::None => false,
            CheckBindings::Operation => true,
            CheckBindings::Txn => at == CheckLevel::Txn,
        }
    }
}

/// Tunables for a caching data store node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Soft cap on the number of cached entries.
    pub cache_size: usize,
    /// Entries scanned per eviction pass when choosing a candidate.
    pub eviction_batch_size: usize,
    /// Free entries the evictor holds in reserve so transactional
    /// operations never stall waiting for capacity.
    pub eviction_reserve_size: usize,
    /// Bound for intra-entry waits that are not tied to a transaction's
    /// stop time (background eviction and downgrade tasks).
    pub lock_timeout: Duration,
    /// Total time to keep retrying a failed I/O operation before treating
    /// the failure as permanent.
    pub max_retry: Duration,
    /// Pause between retries of a failed I/O operation.
    pub retry_wait: Duration,
    /// Number of stripes for the per-entry locks.
    pub num_locks: usize,
    /// How many object ids to allocate from the server at a time.
    pub object_id_batch_size: u64,
    /// Host of the authoritative server.
    pub server_host: String,
    /// Port of the authoritative server.
    pub server_port: u16,
    /// Local port the callback listener binds.
    pub callback_port: u16,
    /// Maximum in-flight items in the update queue.
    pub update_queue_size: usize,
    /// Worker threads used for server fetches.
    pub fetch_threads: usize,
    /// Worker threads used for deferred eviction and downgrade tasks.
    pub task_threads: usize,
    /// Internal binding consistency checking.
    pub check_bindings: CheckBindings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_size: 5000,
            eviction_batch_size: 100,
            eviction_reserve_size: 50,
            lock_timeout: Duration::from_millis(10),
            max_retry: Duration::from_millis(1000),
            retry_wait: Duration::from_millis(10),
            num_locks: 20,
            object_id_batch_size: 1000,
            server_host: "localhost".to_string(),
            server_port: 44540,
            callback_port: 44541,
            update_queue_size: 100,
            fetch_threads: 4,
            task_threads: 2,
            check_bindings: CheckBindings::None,
        }
    }
}

impl StoreConfig {
    /// Config pointing at a specific server endpoint.
    pub fn for_server(host: impl Into<String>, port: u16) -> Self {
        Self {
            server_host: host.into(),
            server_port: port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_size < MIN_CACHE_SIZE {
            return Err(JaalError::Config(format!(
                "cache_size {} is below the minimum {}",
                self.cache_size, MIN_CACHE_SIZE
            )));
        }
        if self.eviction_batch_size == 0 || self.eviction_batch_size > self.cache_size {
            return Err(JaalError::Config(format!(
                "eviction_batch_size {} must be in 1..={}",
                self.eviction_batch_size, self.cache_size
            )));
        }
        if self.eviction_reserve_size > self.cache_size {
            return Err(JaalError::Config(format!(
                "eviction_reserve_size {} exceeds cache_size {}",
                self.eviction_reserve_size, self.cache_size
            )));
        }
        if self.num_locks == 0 {
            return Err(JaalError::Config("num_locks must be at least 1".into()));
        }
        if self.object_id_batch_size == 0 {
            return Err(JaalError::Config(
                "object_id_batch_size must be at least 1".into(),
            ));
        }
        if self.update_queue_size == 0 {
            return Err(JaalError::Config(
                "update_queue_size must be at least 1".into(),
            ));
        }
        if self.fetch_threads == 0 || self.task_threads == 0 {
            return Err(JaalError::Config(
                "worker pools need at least one thread".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_size, 5000);
        assert_eq!(config.num_locks, 20);
        assert_eq!(config.server_port, 44540);
        assert_eq!(config.callback_port, 44541);
    }

    #[test]
    fn test_rejects_tiny_cache() {
        let config = StoreConfig {
            cache_size: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(JaalError::Config(_))));
    }

    #[test]
    fn test_rejects_oversized_batch() {
        let config = StoreConfig {
            cache_size: 1000,
            eviction_batch_size: 2000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_levels() {
        use CheckLevel::*;
        assert!(!CheckBindings::None.should_check(Operation));
        assert!(!CheckBindings::None.should_check(Txn));
        assert!(CheckBindings::Operation.should_check(Operation));
        assert!(CheckBindings::Operation.should_check(Txn));
        assert!(!CheckBindings::Txn.should_check(Operation));
        assert!(CheckBindings::Txn.should_check(Txn));
    }
}
