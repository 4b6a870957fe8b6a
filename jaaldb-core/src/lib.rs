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

//! Core types shared by the JaalDB caching data store crates.
//!
//! This crate carries the pieces every other layer needs: the two key
//! spaces (object ids and ordered binding names), the error type, the
//! store configuration, and the transient I/O retry policy.

pub mod config;
pub mod error;
pub mod key;
pub mod retry;

pub use config::{CheckBindings, CheckLevel, StoreConfig, MIN_CACHE_SIZE};
pub use error::{JaalError, Result};
pub use key::{BindingKey, ObjectId};
pub use retry::{run_io, IoRetry, RetryPolicy};
