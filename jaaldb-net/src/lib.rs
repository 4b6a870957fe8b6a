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

//! Wire protocol between a caching store node and the authoritative server.
//!
//! Three connections exist per node: the request/response connection used
//! for fetches and upgrades, the update-queue connection shipping committed
//! changes in order, and the inbound callback connection on which the server
//! asks the node to evict or downgrade entries.

pub mod callback;
pub mod client;
pub mod frame;
pub mod message;

pub use callback::{CallbackHandler, CallbackListener};
pub use client::{RemoteStoreServer, RemoteUpdateSender, StoreServer, UpdateSender};
pub use message::{
    BindingUpdate, CallbackRequest, CommitBatch, GetBindingForRemoveResults,
    GetBindingForUpdateResults, GetBindingResults, GetObjectForUpdateResults, GetObjectResults,
    NextBoundNameResults, NextObjectResults, ObjectIdRange, ObjectUpdate, RegisterNodeResult,
    Request, Response, UpdateItem, UpgradeObjectResults,
};
