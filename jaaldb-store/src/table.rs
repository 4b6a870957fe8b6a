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

//! The cache table.
//!
//! Objects live in a concurrent hash map; bindings live in an ordered map
//! so the binding-search protocol can ask for the smallest cached entry at
//! or above a key. Entry state is guarded by hash-striped locks handed out
//! here. Capacity is a permit counter: inserting an entry consumes a permit
//! obtained through a [`CacheReservation`], and removing an entry returns
//! one. Reservations are RAII so a permit is released on every path that
//! does not use it.
//!
//! Lock order: a stripe mutex may be held while taking the binding index
//! mutex, never the reverse. The capacity mutex nests inside both.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use jaaldb_core::{BindingKey, JaalError, ObjectId, Result};

use crate::entry::{BindingEntry, ObjectEntry, Stripe};
use crate::evictor::FullFlag;

// =============================================================================
// Capacity permits
// =============================================================================

struct CapacityState {
    available: usize,
}

pub(crate) struct CapacityTracker {
    state: Mutex<CapacityState>,
    cond: Condvar,
    full: Arc<FullFlag>,
}

impl CapacityTracker {
    fn new(capacity: usize, full: Arc<FullFlag>) -> Self {
        Self {
            state: Mutex::new(CapacityState {
                available: capacity,
            }),
            cond: Condvar::new(),
            full,
        }
    }

    fn reserve(self: &Arc<Self>, count: usize) -> CacheReservation {
        let mut state = self.state.lock();
        while state.available < count {
            // The evictor is signalled once per transition into the full
            // state; repeats while already full are absorbed by the flag.
            self.full.signal();
            self.cond.wait(&mut state);
        }
        state.available -= count;
        CacheReservation {
            tracker: Arc::clone(self),
            unused: count,
        }
    }

    fn try_reserve(self: &Arc<Self>, count: usize) -> Option<CacheReservation> {
        let mut state = self.state.lock();
        if state.available < count {
            return None;
        }
        state.available -= count;
        Some(CacheReservation {
            tracker: Arc::clone(self),
            unused: count,
        })
    }

    fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.available += count;
        self.cond.notify_all();
    }

    fn available(&self) -> usize {
        self.state.lock().available
    }
}

/// Permits for entries about to be inserted. Unused permits return to the
/// pool on drop, so reserve and release stay paired on every path.
pub(crate) struct CacheReservation {
    tracker: Arc<CapacityTracker>,
    unused: usize,
}

impl CacheReservation {
    /// Consumes one permit for an entry that was inserted.
    pub(crate) fn take(&mut self) {
        debug_assert!(self.unused > 0, "reservation exhausted");
        self.unused = self.unused.saturating_sub(1);
    }

    pub(crate) fn unused(&self) -> usize {
        self.unused
    }
}

impl Drop for CacheReservation {
    fn drop(&mut self) {
        self.tracker.release(self.unused);
    }
}

// =============================================================================
// Cache table
// =============================================================================

/// A reference to any cached entry, for the evictor's scan.
#[derive(Clone)]
pub(crate) enum AnyEntry {
    Object(Arc<ObjectEntry>),
    Binding(Arc<BindingEntry>),
}

impl AnyEntry {
    pub(crate) fn context_id(&self) -> u64 {
        match self {
            AnyEntry::Object(e) => e.core.context_id(),
            AnyEntry::Binding(e) => e.core.context_id(),
        }
    }

    pub(crate) fn modified(&self) -> bool {
        match self {
            AnyEntry::Object(e) => e.core.modified(),
            AnyEntry::Binding(e) => e.core.modified(),
        }
    }

    pub(crate) fn decached_or_decaching(&self) -> bool {
        match self {
            AnyEntry::Object(e) => e.core.decached() || e.core.decaching(),
            AnyEntry::Binding(e) => e.core.decached() || e.core.decaching(),
        }
    }

    pub(crate) fn decached(&self) -> bool {
        match self {
            AnyEntry::Object(e) => e.core.decached(),
            AnyEntry::Binding(e) => e.core.decached(),
        }
    }
}

enum CursorKey {
    Object(ObjectId),
    Binding(BindingKey),
}

/// Weakly consistent scan position for the evictor. Each sweep snapshots
/// the key set; entries that vanish before the cursor reaches them are
/// skipped.
pub(crate) struct EntryCursor {
    pending: VecDeque<CursorKey>,
}

pub(crate) struct Cache {
    objects: DashMap<ObjectId, Arc<ObjectEntry>>,
    bindings: Mutex<BTreeMap<BindingKey, Arc<BindingEntry>>>,
    stripes: Vec<Stripe>,
    capacity: Arc<CapacityTracker>,
}

impl Cache {
    pub(crate) fn new(capacity: usize, num_locks: usize, full: Arc<FullFlag>) -> Self {
        let stripes = (0..num_locks.max(1)).map(|_| Stripe::new()).collect();
        Self {
            objects: DashMap::new(),
            bindings: Mutex::new(BTreeMap::new()),
            stripes,
            capacity: Arc::new(CapacityTracker::new(capacity, full)),
        }
    }

    // -- Stripe locks --------------------------------------------------------

    fn stripe_index<K: Hash>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    pub(crate) fn object_stripe(&self, oid: ObjectId) -> &Stripe {
        &self.stripes[self.stripe_index(&oid)]
    }

    pub(crate) fn binding_stripe(&self, key: &BindingKey) -> &Stripe {
        &self.stripes[self.stripe_index(key)]
    }

    pub(crate) fn entry_stripe(&self, entry: &AnyEntry) -> &Stripe {
        match entry {
            AnyEntry::Object(e) => self.object_stripe(e.oid),
            AnyEntry::Binding(e) => self.binding_stripe(&e.key),
        }
    }

    /// Wakes every entry waiter. Used when a global condition changes, such
    /// as the update queue settling contexts or the node failing.
    pub(crate) fn notify_all_stripes(&self) {
        for stripe in &self.stripes {
            let _guard = stripe.lock();
            stripe.notify_all();
        }
    }

    // -- Capacity ------------------------------------------------------------

    /// Blocks until `count` permits are free. Must not be called with a
    /// stripe lock held.
    pub(crate) fn reserve(&self, count: usize) -> CacheReservation {
        self.capacity.reserve(count)
    }

    pub(crate) fn try_reserve(&self, count: usize) -> Option<CacheReservation> {
        self.capacity.try_reserve(count)
    }

    pub(crate) fn available(&self) -> usize {
        self.capacity.available()
    }

    // -- Objects -------------------------------------------------------------

    pub(crate) fn get_object_entry(&self, oid: ObjectId) -> Option<Arc<ObjectEntry>> {
        self.objects.get(&oid).map(|entry| Arc::clone(&entry))
    }

    pub(crate) fn add_object_entry(
        &self,
        entry: Arc<ObjectEntry>,
        reservation: &mut CacheReservation,
    ) {
        reservation.take();
        let previous = self.objects.insert(entry.oid, entry);
        debug_assert!(previous.is_none(), "object entry already cached");
    }

    pub(crate) fn remove_object_entry(&self, oid: ObjectId) {
        if self.objects.remove(&oid).is_some() {
            self.capacity.release(1);
        }
    }

    // -- Bindings ------------------------------------------------------------

    pub(crate) fn get_binding_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        self.bindings.lock().get(key).cloned()
    }

    /// Smallest cached binding entry with key at or above `key`.
    pub(crate) fn ceiling_binding_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        self.bindings
            .lock()
            .range((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(_, entry)| Arc::clone(entry))
    }

    /// Smallest cached binding entry with key strictly above `key`.
    pub(crate) fn higher_binding_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        self.bindings
            .lock()
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, entry)| Arc::clone(entry))
    }

    pub(crate) fn add_binding_entry(
        &self,
        entry: Arc<BindingEntry>,
        reservation: &mut CacheReservation,
    ) {
        reservation.take();
        let previous = self.bindings.lock().insert(entry.key.clone(), entry);
        debug_assert!(previous.is_none(), "binding entry already cached");
    }

    pub(crate) fn remove_binding_entry(&self, key: &BindingKey) {
        if self.bindings.lock().remove(key).is_some() {
            self.capacity.release(1);
        }
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.objects.len() + self.bindings.lock().len()
    }

    // -- Scanning ------------------------------------------------------------

    pub(crate) fn entry_cursor(&self) -> EntryCursor {
        EntryCursor {
            pending: VecDeque::new(),
        }
    }

    /// Delivers up to `max` live entries, refilling the cursor with a fresh
    /// key snapshot when a sweep completes.
    pub(crate) fn next_batch(&self, cursor: &mut EntryCursor, max: usize) -> Vec<AnyEntry> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            let key = match cursor.pending.pop_front() {
                Some(key) => key,
                None => {
                    if !batch.is_empty() {
                        break;
                    }
                    for item in self.objects.iter() {
                        cursor.pending.push_back(CursorKey::Object(*item.key()));
                    }
                    for key in self.bindings.lock().keys() {
                        cursor.pending.push_back(CursorKey::Binding(key.clone()));
                    }
                    if cursor.pending.is_empty() {
                        break;
                    }
                    continue;
                }
            };
            match key {
                CursorKey::Object(oid) => {
                    if let Some(entry) = self.get_object_entry(oid) {
                        batch.push(AnyEntry::Object(entry));
                    }
                }
                CursorKey::Binding(key) => {
                    if let Some(entry) = self.get_binding_entry(&key) {
                        batch.push(AnyEntry::Binding(entry));
                    }
                }
            }
        }
        batch
    }

    // -- Consistency checking ------------------------------------------------

    /// Verifies the binding-range invariants across the ordered index. Runs
    /// only when configured; failures are fatal.
    pub(crate) fn check_bindings(&self) -> Result<()> {
        let entries: Vec<Arc<BindingEntry>> = self.bindings.lock().values().cloned().collect();
        for pair in entries.windows(2) {
            let below = &pair[0];
            let above = &pair[1];
            if below.key >= above.key {
                return Err(JaalError::CacheConsistency(format!(
                    "binding index out of order near {}",
                    below.key
                )));
            }
            if let Some(previous) = above.previous_key() {
                if previous >= above.key {
                    return Err(JaalError::CacheConsistency(format!(
                        "entry {} has previous key {} at or above itself",
                        above.key, previous
                    )));
                }
                // A bound entry strictly inside a certified-unbound range
                // contradicts the certificate.
                if previous < below.key
                    && below.key < above.key
                    && below.core.readable()
                    && below.value().is_some()
                {
                    return Err(JaalError::CacheConsistency(format!(
                        "entry {} lies inside the unbound range certified by {}",
                        below.key, above.key
                    )));
                }
            }
        }
        for entry in &entries {
            if let Some(previous) = entry.previous_key() {
                if previous >= entry.key {
                    return Err(JaalError::CacheConsistency(format!(
                        "entry {} has previous key {} at or above itself",
                        entry.key, previous
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cache(capacity: usize) -> Cache {
        Cache::new(capacity, 4, Arc::new(FullFlag::new()))
    }

    #[test]
    fn test_ceiling_and_higher() {
        let cache = new_cache(100);
        let mut reservation = cache.reserve(2);
        cache.add_binding_entry(
            Arc::new(BindingEntry::cached(
                BindingKey::for_name("b"),
                Some(1),
                false,
                1,
            )),
            &mut reservation,
        );
        cache.add_binding_entry(
            Arc::new(BindingEntry::cached(
                BindingKey::for_name("d"),
                Some(2),
                false,
                1,
            )),
            &mut reservation,
        );

        let a = BindingKey::for_name("a");
        let b = BindingKey::for_name("b");
        let c = BindingKey::for_name("c");
        let e = BindingKey::for_name("e");

        assert_eq!(cache.ceiling_binding_entry(&a).unwrap().key, b);
        assert_eq!(cache.ceiling_binding_entry(&b).unwrap().key, b);
        assert_eq!(
            cache.higher_binding_entry(&b).unwrap().key,
            BindingKey::for_name("d")
        );
        assert_eq!(
            cache.ceiling_binding_entry(&c).unwrap().key,
            BindingKey::for_name("d")
        );
        assert!(cache.ceiling_binding_entry(&e).is_none());
    }

    #[test]
    fn test_reservation_releases_unused() {
        let cache = new_cache(10);
        {
            let _reservation = cache.reserve(4);
            assert_eq!(cache.available(), 6);
        }
        assert_eq!(cache.available(), 10);
    }

    #[test]
    fn test_capacity_accounting_through_insert_and_remove() {
        let cache = new_cache(10);
        let mut reservation = cache.reserve(1);
        cache.add_object_entry(Arc::new(ObjectEntry::cached(7, None, 1)), &mut reservation);
        drop(reservation);
        assert_eq!(cache.available(), 9);
        assert_eq!(cache.entry_count(), 1);

        cache.remove_object_entry(7);
        assert_eq!(cache.available(), 10);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_full_flag_signalled_when_blocked() {
        let full = Arc::new(FullFlag::new());
        let cache = Cache::new(2, 4, Arc::clone(&full));
        let held = cache.reserve(2);

        let waiter = {
            std::thread::spawn({
                let full = Arc::clone(&full);
                move || full.wait_full(std::time::Duration::from_secs(5))
            })
        };

        // A blocked reserve must signal the evictor. Release from another
        // thread so the blocked reserve can complete.
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(held);
        });
        let reservation = cache.reserve(1);
        assert_eq!(reservation.unused(), 1);
        assert!(waiter.join().unwrap());
        releaser.join().unwrap();
    }

    #[test]
    fn test_cursor_sweeps_everything() {
        let cache = new_cache(100);
        let mut reservation = cache.reserve(5);
        for oid in 0..3 {
            cache.add_object_entry(
                Arc::new(ObjectEntry::cached(oid, None, 1)),
                &mut reservation,
            );
        }
        for name in ["x", "y"] {
            cache.add_binding_entry(
                Arc::new(BindingEntry::cached(
                    BindingKey::for_name(name),
                    Some(1),
                    false,
                    1,
                )),
                &mut reservation,
            );
        }

        let mut cursor = cache.entry_cursor();
        let mut seen = 0;
        loop {
            let batch = cache.next_batch(&mut cursor, 2);
            if batch.is_empty() {
                break;
            }
            seen += batch.len();
            if seen >= 5 {
                break;
            }
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_check_bindings_flags_bound_entry_in_certified_range() {
        let cache = new_cache(100);
        let mut reservation = cache.reserve(2);
        cache.add_binding_entry(
            Arc::new(BindingEntry::cached(
                BindingKey::for_name("c"),
                Some(1),
                false,
                1,
            )),
            &mut reservation,
        );
        let top = Arc::new(BindingEntry::cached(
            BindingKey::for_name("f"),
            Some(2),
            false,
            1,
        ));
        top.update_previous_key(&BindingKey::for_name("a"), crate::entry::BindingState::Unbound);
        cache.add_binding_entry(top, &mut reservation);

        assert!(matches!(
            cache.check_bindings(),
            Err(JaalError::CacheConsistency(_))
        ));
    }
}
