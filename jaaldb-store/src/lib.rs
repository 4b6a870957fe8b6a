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

//! The client-side caching data store.
//!
//! Each participating node runs one [`CachingStore`]. It presents a single
//! logical key/value space over two namespaces, object ids and ordered name
//! bindings, while physically caching entries locally and coordinating
//! read/write access through a central authoritative server. Local
//! transactions get read-your-writes semantics; committed changes ship to
//! the server asynchronously, in commit order, through the update queue.
//!
//! The cache is volatile. It is a coherence cache over the server's
//! persisted state, not a log; losing it loses nothing.

mod context;
mod entry;
mod evictor;
mod oid;
mod pool;
mod queue;
mod table;

pub mod store;

use std::fmt;

pub use jaaldb_core::{BindingKey, CheckBindings, JaalError, ObjectId, Result, StoreConfig};
pub use store::{BindingValue, CachingStore};

/// Identifier of an active transaction on this node. Doubles as the
/// transaction's context ordinal: ids increase monotonically in join order
/// and the update queue uses them to decide when an entry's last writer has
/// been fully shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub(crate) u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Read or write intent, reported to the external access coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Seam to the external access coordinator that serializes conflicting
/// transactions across names and object ids. The store reports every access
/// it is about to rely on; the default implementation does nothing.
pub trait AccessReporter: Send + Sync {
    fn report_object_access(&self, oid: ObjectId, access: AccessKind);
    fn report_name_access(&self, key: &BindingKey, access: AccessKind);
}

/// An [`AccessReporter`] that ignores every report.
pub struct NoopAccessReporter;

impl AccessReporter for NoopAccessReporter {
    fn report_object_access(&self, _oid: ObjectId, _access: AccessKind) {}
    fn report_name_access(&self, _key: &BindingKey, _access: AccessKind) {}
}

/// Seam to the external watchdog service. Installed after construction;
/// notified once when the node transitions to failed.
pub trait Watchdog: Send + Sync {
    fn report_failure(&self, node_id: u64, component: &str);
}
