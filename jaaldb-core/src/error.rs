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

//! Error types for JaalDB

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JaalError {
    /// A transient I/O failure. Operations hitting this variant are retried
    /// under the store's retry policy before anything is surfaced.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A permanent network failure. Raised after the retry policy gives up,
    /// and by every operation once the node has been marked failed.
    #[error("network failure: {0}")]
    Network(String),

    #[error("object not found: oid {0}")]
    ObjectNotFound(u64),

    /// An intra-store wait exceeded the transaction's stop time. The
    /// transaction should be aborted and may be retried by the caller.
    #[error("transaction timed out after waiting {waited:?}")]
    TxnTimeout { waited: Duration },

    /// An internal cache invariant was violated. Fatal; the node is marked
    /// failed when this is reported.
    #[error("cache consistency failure: {0}")]
    CacheConsistency(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no class info found for class id {0}")]
    ClassInfoNotFound(u32),

    #[error("data store is shut down")]
    Shutdown,
}

impl JaalError {
    /// Whether the error is a transient I/O failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, JaalError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, JaalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_is_transient() {
        let err = JaalError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_transient());
        assert!(!JaalError::Network("down".into()).is_transient());
        assert!(!JaalError::ObjectNotFound(7).is_transient());
    }
}
