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

//! The eviction thread.
//!
//! One background thread keeps the cache under its soft limit. It normally
//! sits on a reserve of free entries so transactional operations never
//! block on capacity. When the cache fills, it releases the reserve, scans
//! a bounded batch of entries for the best LRU candidate, and either evicts
//! it immediately through the update queue or, if the entry is in use,
//! hands it to a deferred task that retries once the entry is quiescent.
//! The reserve is re-acquired once free capacity reaches twice its size.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::store::StoreInner;
use crate::table::AnyEntry;

/// Latch the cache table sets when a reservation blocks. Extra signals
/// while already full are absorbed.
pub(crate) struct FullFlag {
    full: Mutex<bool>,
    cond: Condvar,
}

impl FullFlag {
    pub(crate) fn new() -> Self {
        Self {
            full: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut full = self.full.lock();
        if !*full {
            *full = true;
            self.cond.notify_all();
        }
    }

    /// Waits for the full signal, clearing it. Returns whether the signal
    /// fired before the timeout.
    pub(crate) fn wait_full(&self, timeout: Duration) -> bool {
        let mut full = self.full.lock();
        if !*full {
            self.cond.wait_for(&mut full, timeout);
        }
        let was_full = *full;
        *full = false;
        was_full
    }
}

/// Snapshot of an entry's eviction-relevant state, taken under its stripe
/// lock during the scan.
struct EntryInfo {
    in_use: bool,
    in_use_for_write: bool,
    context_id: u64,
}

impl EntryInfo {
    /// LRU preference: idle entries first, then entries with no pending
    /// write, then the oldest last use.
    fn prefer_to(&self, other: &EntryInfo) -> bool {
        if self.in_use != other.in_use {
            return !self.in_use;
        }
        if self.in_use_for_write != other.in_use_for_write {
            return !self.in_use_for_write;
        }
        self.context_id < other.context_id
    }
}

/// Poll interval for the shutdown check while idle.
const IDLE_WAIT: Duration = Duration::from_millis(100);

pub(crate) fn run(store: Arc<StoreInner>) {
    let reserve_size = store.config.eviction_reserve_size;
    let mut reservation = store.cache.try_reserve(reserve_size);
    let mut cursor = store.cache.entry_cursor();
    debug!(reserve_size, "evictor started");

    while !store.shutdown_txns_completed() {
        if reservation.is_some() {
            if !store.full_flag.wait_full(IDLE_WAIT) {
                continue;
            }
            // The cache is full. Hand the reserve back so blocked
            // operations proceed, then start evicting.
            trace!("cache full, releasing the eviction reserve");
            reservation = None;
        } else if store.cache.available() + store.pending_evictions.load(Ordering::SeqCst)
            >= 2 * reserve_size
        {
            reservation = store.cache.try_reserve(reserve_size);
        } else {
            try_evict(&store, &mut cursor);
        }
    }
    debug!("evictor stopped");
}

/// Scans one batch and evicts the best candidate, if any.
fn try_evict(store: &Arc<StoreInner>, cursor: &mut crate::table::EntryCursor) {
    let batch = store
        .cache
        .next_batch(cursor, store.config.eviction_batch_size);
    if batch.is_empty() {
        std::thread::sleep(IDLE_WAIT);
        return;
    }

    let mut best: Option<(AnyEntry, EntryInfo)> = None;
    for entry in batch {
        if store.shutdown_txns_completed() {
            return;
        }
        let stripe = store.cache.entry_stripe(&entry);
        let _guard = stripe.lock();
        if entry.decached_or_decaching() {
            continue;
        }
        let in_use = store.entry_in_use(&entry);
        let info = EntryInfo {
            in_use,
            in_use_for_write: entry.modified() && in_use,
            context_id: entry.context_id(),
        };
        let better = match &best {
            Some((_, current)) => info.prefer_to(current),
            None => true,
        };
        if better {
            best = Some((entry, info));
        }
    }

    let Some((entry, _)) = best else {
        return;
    };
    let stripe = store.cache.entry_stripe(&entry);
    let _guard = stripe.lock();
    if entry.decached() || entry.decached_or_decaching() {
        return;
    }
    if !store.entry_in_use(&entry) {
        store.evict_entry_now(&entry, stripe);
    } else {
        store.schedule_evict_task_for(&entry);
    }
}
