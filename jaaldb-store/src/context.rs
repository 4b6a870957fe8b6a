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

//! Per-transaction state.
//!
//! Every active transaction owns one context. Reads record accesses so
//! prepare can verify nothing was evicted underneath the transaction.
//! Writes apply to the cached entry immediately, which is what gives the
//! transaction read-your-writes, and the context keeps the displaced state
//! as an undo record so abort can put everything back. Commit turns the
//! touched entries into one atomic batch for the update queue; the entries
//! stay marked modified and in use for write until the batch is
//! acknowledged.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use jaaldb_core::{BindingKey, JaalError, ObjectId, Result};
use jaaldb_net::{BindingUpdate, ObjectUpdate};

use crate::entry::{BindingEntry, ObjectEntry, Stripe};
use crate::queue::UpdateQueue;
use crate::table::{Cache, CacheReservation};
use crate::TxnId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EntryKey {
    Object(ObjectId),
    Binding(BindingKey),
}

struct ObjectUndo {
    old_value: Option<Vec<u8>>,
    old_modified: bool,
    created: bool,
}

struct BindingUndo {
    old_oid: Option<ObjectId>,
    old_modified: bool,
    old_previous: Option<BindingKey>,
    old_previous_unbound: bool,
    created: bool,
}

struct ContextInner {
    accesses: HashSet<EntryKey>,
    object_undo: HashMap<ObjectId, ObjectUndo>,
    binding_undo: HashMap<BindingKey, BindingUndo>,
    new_oids: Vec<ObjectId>,
    prepared: bool,
}

/// The state of one active transaction.
pub(crate) struct TxnContext {
    pub(crate) context_id: u64,
    pub(crate) stop_time: Instant,
    inner: Mutex<ContextInner>,
}

impl TxnContext {
    fn new(context_id: u64, stop_time: Instant) -> Self {
        Self {
            context_id,
            stop_time,
            inner: Mutex::new(ContextInner {
                accesses: HashSet::new(),
                object_undo: HashMap::new(),
                binding_undo: HashMap::new(),
                new_oids: Vec::new(),
                prepared: false,
            }),
        }
    }

    pub(crate) fn txn_id(&self) -> TxnId {
        TxnId(self.context_id)
    }

    // -- Access recording ----------------------------------------------------

    pub(crate) fn note_object_access(&self, entry: &ObjectEntry) {
        entry.core.set_context_id(self.context_id);
        self.inner
            .lock()
            .accesses
            .insert(EntryKey::Object(entry.oid));
    }

    pub(crate) fn note_binding_access(&self, entry: &BindingEntry) {
        entry.core.set_context_id(self.context_id);
        self.inner
            .lock()
            .accesses
            .insert(EntryKey::Binding(entry.key.clone()));
    }

    // -- Entry creation ------------------------------------------------------

    /// Reserves an object entry for a fetch in flight. Caller holds the
    /// object's stripe lock.
    pub(crate) fn note_fetching_object(
        &self,
        cache: &Cache,
        oid: ObjectId,
        reservation: &mut CacheReservation,
    ) -> Arc<ObjectEntry> {
        let entry = Arc::new(ObjectEntry::fetching(oid, self.context_id));
        cache.add_object_entry(Arc::clone(&entry), reservation);
        self.note_object_access(&entry);
        entry
    }

    /// Installs a fetched object value. Caller holds the stripe lock; the
    /// entry is in the fetching state.
    pub(crate) fn note_cached_object(
        &self,
        entry: &Arc<ObjectEntry>,
        stripe: &Stripe,
        data: Option<Vec<u8>>,
        for_write: bool,
    ) {
        entry.set_value(data);
        if for_write {
            entry.core.set_cached_write(stripe);
        } else {
            entry.core.set_cached_read(stripe);
        }
        self.note_object_access(entry);
    }

    /// Caches an object value directly, readable, outside any fetch.
    pub(crate) fn note_cached_object_value(
        &self,
        cache: &Cache,
        oid: ObjectId,
        data: Option<Vec<u8>>,
        reservation: &mut CacheReservation,
    ) -> Arc<ObjectEntry> {
        let entry = Arc::new(ObjectEntry::cached(oid, data, self.context_id));
        cache.add_object_entry(Arc::clone(&entry), reservation);
        self.note_object_access(&entry);
        entry
    }

    /// Records a locally allocated object id and creates its writable
    /// entry. The entry is removed again if the transaction aborts.
    pub(crate) fn note_new_object(
        &self,
        cache: &Cache,
        oid: ObjectId,
        reservation: &mut CacheReservation,
    ) -> Arc<ObjectEntry> {
        let entry = Arc::new(ObjectEntry::created(oid, self.context_id));
        cache.add_object_entry(Arc::clone(&entry), reservation);
        {
            let mut inner = self.inner.lock();
            inner.new_oids.push(oid);
            inner.object_undo.entry(oid).or_insert(ObjectUndo {
                old_value: None,
                old_modified: false,
                created: true,
            });
        }
        self.note_object_access(&entry);
        entry
    }

    /// Installs a binding entry fetched from the server. Caller holds the
    /// binding's stripe lock.
    pub(crate) fn note_cached_binding(
        &self,
        cache: &Cache,
        key: BindingKey,
        oid: Option<ObjectId>,
        for_write: bool,
        reservation: &mut CacheReservation,
    ) -> Arc<BindingEntry> {
        let entry = Arc::new(BindingEntry::cached(
            key,
            oid,
            for_write,
            self.context_id,
        ));
        cache.add_binding_entry(Arc::clone(&entry), reservation);
        self.note_binding_access(&entry);
        entry
    }

    /// Creates a writable entry for a name this transaction is binding for
    /// the first time. Removed again on abort.
    pub(crate) fn note_created_binding(
        &self,
        cache: &Cache,
        key: BindingKey,
        reservation: &mut CacheReservation,
    ) -> Arc<BindingEntry> {
        let entry = Arc::new(BindingEntry::cached(
            key.clone(),
            None,
            true,
            self.context_id,
        ));
        cache.add_binding_entry(Arc::clone(&entry), reservation);
        self.inner.lock().binding_undo.entry(key).or_insert(BindingUndo {
            old_oid: None,
            old_modified: false,
            old_previous: None,
            old_previous_unbound: false,
            created: true,
        });
        self.note_binding_access(&entry);
        entry
    }

    /// Creates the provisional entry for the end of the namespace, in the
    /// fetching state until the server's answer promotes or collapses it.
    pub(crate) fn note_last_binding(
        &self,
        cache: &Cache,
        reservation: &mut CacheReservation,
    ) -> Arc<BindingEntry> {
        let entry = Arc::new(BindingEntry::fetching(BindingKey::Last, self.context_id));
        cache.add_binding_entry(Arc::clone(&entry), reservation);
        self.note_binding_access(&entry);
        entry
    }

    // -- Modifications -------------------------------------------------------

    /// Buffers an object write: the entry takes the new value now, the old
    /// one goes into the undo record. Caller holds the stripe lock and the
    /// entry is writable.
    pub(crate) fn note_modified_object(&self, entry: &Arc<ObjectEntry>, data: Option<Vec<u8>>) {
        debug_assert!(entry.core.writable());
        {
            let mut inner = self.inner.lock();
            inner.object_undo.entry(entry.oid).or_insert_with(|| ObjectUndo {
                old_value: entry.value(),
                old_modified: entry.core.modified(),
                created: false,
            });
        }
        entry.set_value(data);
        entry.core.set_modified();
        self.note_object_access(entry);
    }

    /// Buffers a binding write. Also used on a successor entry whose
    /// previous-key certificate is about to change, so the undo record
    /// captures the certificate as well as the value.
    pub(crate) fn note_modified_binding(
        &self,
        entry: &Arc<BindingEntry>,
        oid: Option<ObjectId>,
    ) {
        debug_assert!(entry.core.writable());
        {
            let mut inner = self.inner.lock();
            inner
                .binding_undo
                .entry(entry.key.clone())
                .or_insert_with(|| {
                    let (old_previous, old_previous_unbound) = entry.previous_key_info();
                    BindingUndo {
                        old_oid: entry.value(),
                        old_modified: entry.core.modified(),
                        old_previous,
                        old_previous_unbound,
                        created: false,
                    }
                });
        }
        entry.set_value(oid);
        entry.core.set_modified();
        self.note_binding_access(entry);
    }

    /// The smallest object id this transaction created that is above
    /// `after`, if any.
    pub(crate) fn next_new_object_id(&self, after: Option<ObjectId>) -> Option<ObjectId> {
        let inner = self.inner.lock();
        inner
            .new_oids
            .iter()
            .copied()
            .filter(|oid| after.map_or(true, |a| *oid > a))
            .min()
    }

    // -- Prepare, commit, abort ----------------------------------------------

    /// Validates the transaction and marks it prepared. No I/O. Returns
    /// whether the transaction is read-only.
    pub(crate) fn prepare(&self, cache: &Cache) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.prepared {
            return Err(JaalError::IllegalState(
                "transaction already prepared".to_string(),
            ));
        }
        for key in &inner.accesses {
            let gone = match key {
                EntryKey::Object(oid) => cache
                    .get_object_entry(*oid)
                    .map_or(true, |entry| entry.core.decached()),
                EntryKey::Binding(key) => cache
                    .get_binding_entry(key)
                    .map_or(true, |entry| entry.core.decached()),
            };
            if gone {
                return Err(JaalError::CacheConsistency(format!(
                    "accessed entry {:?} left the cache before prepare",
                    key
                )));
            }
        }
        inner.prepared = true;
        Ok(inner.object_undo.is_empty()
            && inner.binding_undo.is_empty()
            && inner.new_oids.is_empty())
    }

    pub(crate) fn ensure_prepared(&self, cache: &Cache) -> Result<()> {
        if !self.inner.lock().prepared {
            self.prepare(cache)?;
        }
        Ok(())
    }

    /// Ships the transaction's writes as one atomic batch, ordered by key.
    /// Blocks only while the update queue is at capacity.
    pub(crate) fn commit(&self, cache: &Cache, queue: &UpdateQueue) -> Result<()> {
        let (object_keys, binding_keys, mut created_oids) = {
            let inner = self.inner.lock();
            let mut object_keys: Vec<ObjectId> = inner.object_undo.keys().copied().collect();
            object_keys.sort_unstable();
            let mut binding_keys: Vec<BindingKey> =
                inner.binding_undo.keys().cloned().collect();
            binding_keys.sort();
            (object_keys, binding_keys, inner.new_oids.clone())
        };
        created_oids.sort_unstable();

        let mut object_updates = Vec::with_capacity(object_keys.len());
        for oid in object_keys {
            let stripe = cache.object_stripe(oid);
            let _guard = stripe.lock();
            let Some(entry) = cache.get_object_entry(oid) else {
                return Err(JaalError::CacheConsistency(format!(
                    "modified object {} left the cache before commit",
                    oid
                )));
            };
            if !entry.core.modified() {
                // A created object that was never written has nothing to
                // ship.
                continue;
            }
            object_updates.push(ObjectUpdate {
                oid,
                data: entry.value(),
            });
        }

        let mut binding_updates = Vec::with_capacity(binding_keys.len());
        for key in binding_keys {
            let stripe = cache.binding_stripe(&key);
            let _guard = stripe.lock();
            let Some(entry) = cache.get_binding_entry(&key) else {
                return Err(JaalError::CacheConsistency(format!(
                    "modified binding {} left the cache before commit",
                    key
                )));
            };
            let (previous_key, previous_key_unbound) = entry.previous_key_info();
            binding_updates.push(BindingUpdate {
                key,
                oid: entry.value(),
                previous_key,
                previous_key_unbound,
            });
        }

        if object_updates.is_empty() && binding_updates.is_empty() && created_oids.is_empty() {
            trace!(context_id = self.context_id, "read-only commit");
            queue.note_context_finished(self.context_id);
            return Ok(());
        }
        queue.commit(self.context_id, created_oids, object_updates, binding_updates)
    }

    /// Restores every entry this transaction touched for write and removes
    /// the entries it created. Cached reads stay in place.
    pub(crate) fn abort(&self, cache: &Cache, queue: &UpdateQueue) {
        // Drain the undo state before touching stripe locks; fetch
        // completions for this context take stripe locks first.
        let (object_undos, binding_undos) = {
            let mut inner = self.inner.lock();
            inner.new_oids.clear();
            (
                inner.object_undo.drain().collect::<Vec<_>>(),
                inner.binding_undo.drain().collect::<Vec<_>>(),
            )
        };
        for (oid, undo) in object_undos {
            let stripe = cache.object_stripe(oid);
            let _guard = stripe.lock();
            let Some(entry) = cache.get_object_entry(oid) else {
                continue;
            };
            if undo.created {
                entry.core.set_evicted_immediate(stripe);
                cache.remove_object_entry(oid);
            } else {
                entry.set_value(undo.old_value);
                if !undo.old_modified {
                    entry.core.clear_modified();
                }
            }
        }
        for (key, undo) in binding_undos {
            let stripe = cache.binding_stripe(&key);
            let _guard = stripe.lock();
            let Some(entry) = cache.get_binding_entry(&key) else {
                continue;
            };
            if undo.created {
                entry.core.set_evicted_immediate(stripe);
                cache.remove_binding_entry(&key);
            } else {
                entry.set_value(undo.old_oid);
                entry.set_previous_key(undo.old_previous, undo.old_previous_unbound);
                if !undo.old_modified {
                    entry.core.clear_modified();
                }
            }
        }
        queue.note_context_finished(self.context_id);
    }
}

// =============================================================================
// Context map
// =============================================================================

/// Maps transaction ids to their contexts and assigns context ordinals.
pub(crate) struct TxnContextMap {
    contexts: Mutex<HashMap<u64, Arc<TxnContext>>>,
    next_id: AtomicU64,
}

impl TxnContextMap {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn create(&self, stop_time: Instant) -> Arc<TxnContext> {
        let context_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let context = Arc::new(TxnContext::new(context_id, stop_time));
        self.contexts.lock().insert(context_id, Arc::clone(&context));
        context
    }

    pub(crate) fn join(&self, txn: TxnId) -> Result<Arc<TxnContext>> {
        self.contexts.lock().get(&txn.0).cloned().ok_or_else(|| {
            JaalError::IllegalState(format!("{} is not an active transaction", txn))
        })
    }

    pub(crate) fn remove(&self, txn: TxnId) -> Result<Arc<TxnContext>> {
        self.contexts.lock().remove(&txn.0).ok_or_else(|| {
            JaalError::IllegalState(format!("{} is not an active transaction", txn))
        })
    }

    pub(crate) fn active_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evictor::FullFlag;
    use jaaldb_core::RetryPolicy;
    use jaaldb_net::{UpdateItem, UpdateSender};
    use std::time::Duration;

    struct RecordingSender {
        items: Mutex<Vec<UpdateItem>>,
    }

    impl UpdateSender for RecordingSender {
        fn send(&self, item: UpdateItem) -> Result<()> {
            self.items.lock().push(item);
            Ok(())
        }
    }

    fn fixture() -> (Cache, UpdateQueue, Arc<RecordingSender>, TxnContextMap) {
        let cache = Cache::new(1000, 4, Arc::new(FullFlag::new()));
        let sender = Arc::new(RecordingSender {
            items: Mutex::new(Vec::new()),
        });
        let queue = UpdateQueue::new(
            1,
            16,
            Arc::clone(&sender) as Arc<dyn UpdateSender>,
            RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1)),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );
        (cache, queue, sender, TxnContextMap::new())
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_commit_ships_key_ordered_batch() {
        let (cache, queue, sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);

        let mut reservation = cache.reserve(3);
        // Touch objects out of order; the batch must come out sorted.
        for oid in [9u64, 2, 5] {
            let stripe = cache.object_stripe(oid);
            let _guard = stripe.lock();
            let entry = context.note_new_object(&cache, oid, &mut reservation);
            context.note_modified_object(&entry, Some(vec![oid as u8]));
        }
        drop(reservation);

        assert!(!context.prepare(&cache).unwrap());
        context.commit(&cache, &queue).unwrap();
        queue.shutdown();

        let items = sender.items.lock();
        assert_eq!(items.len(), 1);
        let UpdateItem::Commit(batch) = &items[0] else {
            panic!("expected a commit batch");
        };
        assert_eq!(batch.context_id, context.context_id);
        assert_eq!(batch.created_oids, vec![2, 5, 9]);
        let oids: Vec<u64> = batch.object_updates.iter().map(|u| u.oid).collect();
        assert_eq!(oids, vec![2, 5, 9]);
        assert_eq!(batch.object_updates[0].data, Some(vec![2]));
        assert_eq!(queue.highest_settled_context_id(), context.context_id);
    }

    #[test]
    fn test_abort_restores_modified_binding() {
        let (cache, queue, _sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);

        let mut reservation = cache.reserve(1);
        let key = BindingKey::for_name("n");
        let entry = {
            let stripe = cache.binding_stripe(&key);
            let _guard = stripe.lock();
            context.note_cached_binding(&cache, key.clone(), Some(4), true, &mut reservation)
        };
        entry.set_previous_key(Some(BindingKey::First), true);

        {
            let stripe = cache.binding_stripe(&key);
            let _guard = stripe.lock();
            context.note_modified_binding(&entry, Some(9));
            entry.set_previous_key(Some(BindingKey::for_name("a")), false);
        }
        assert_eq!(entry.value(), Some(9));

        context.abort(&cache, &queue);
        assert_eq!(entry.value(), Some(4));
        assert_eq!(entry.previous_key(), Some(BindingKey::First));
        assert!(entry.previous_key_unbound());
        assert!(!entry.core.modified());
        assert_eq!(queue.highest_settled_context_id(), context.context_id);
    }

    #[test]
    fn test_abort_removes_created_entries() {
        let (cache, queue, _sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);

        let mut reservation = cache.reserve(2);
        {
            let stripe = cache.object_stripe(70);
            let _guard = stripe.lock();
            context.note_new_object(&cache, 70, &mut reservation);
        }
        let key = BindingKey::for_name("fresh");
        {
            let stripe = cache.binding_stripe(&key);
            let _guard = stripe.lock();
            context.note_created_binding(&cache, key.clone(), &mut reservation);
        }
        drop(reservation);
        assert_eq!(cache.entry_count(), 2);

        context.abort(&cache, &queue);
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.available(), 1000);
    }

    #[test]
    fn test_prepare_flags_decached_access() {
        let (cache, queue, _sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);

        let mut reservation = cache.reserve(1);
        let entry = {
            let stripe = cache.object_stripe(8);
            let _guard = stripe.lock();
            context.note_cached_object_value(&cache, 8, Some(vec![1]), &mut reservation)
        };
        {
            let stripe = cache.object_stripe(8);
            let _guard = stripe.lock();
            entry.core.set_evicting(stripe);
            entry.core.set_evicted(stripe);
        }
        cache.remove_object_entry(8);

        assert!(matches!(
            context.prepare(&cache),
            Err(JaalError::CacheConsistency(_))
        ));
    }

    #[test]
    fn test_read_only_commit_settles_immediately() {
        let (cache, queue, sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);

        assert!(context.prepare(&cache).unwrap());
        context.commit(&cache, &queue).unwrap();
        assert_eq!(queue.highest_settled_context_id(), context.context_id);
        queue.shutdown();
        assert!(sender.items.lock().is_empty());
    }

    #[test]
    fn test_next_new_object_id() {
        let (cache, queue, _sender, contexts) = fixture();
        let context = contexts.create(far());
        queue.note_context_started(context.context_id);
        let mut reservation = cache.reserve(3);
        for oid in [10u64, 20, 30] {
            let stripe = cache.object_stripe(oid);
            let _guard = stripe.lock();
            context.note_new_object(&cache, oid, &mut reservation);
        }
        drop(reservation);
        assert_eq!(context.next_new_object_id(None), Some(10));
        assert_eq!(context.next_new_object_id(Some(10)), Some(20));
        assert_eq!(context.next_new_object_id(Some(30)), None);
    }
}
