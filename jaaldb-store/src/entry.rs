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

//! Cache entries and their lifecycle.
//!
//! Every cached object and binding is one entry moving through a small
//! state machine: fetching, readable, upgrading, writable, downgrading,
//! decaching, decached. Decached is terminal; the entry must leave the
//! cache table before its key can be cached again.
//!
//! State is guarded by a stripe lock chosen by key hash. All mutation
//! happens with the stripe mutex held, and threads waiting for a state
//! change block on the stripe's condvar bounded by their transaction's stop
//! time. Fields use atomics so holders of the stripe lock can read and
//! write them without a second lock level; the stripe mutex is what makes
//! compound updates atomic.
//!
//! Binding entries carry extra range information: `previous_key` plus the
//! `previous_key_unbound` flag certify that the open interval
//! `(previous_key, key)` contains no bound names. That certificate is how
//! the cache remembers absence without an entry per absent name. The
//! `pending_previous` flag marks the interval as owned by some in-flight
//! operation; nothing else may act on names inside it until cleared.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use jaaldb_core::{BindingKey, JaalError, ObjectId, Result};

/// One lock stripe: a mutex for entry state plus the condvar entry waiters
/// block on. Never held across server I/O.
pub(crate) struct Stripe {
    pub(crate) mutex: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl Stripe {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock()
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }
}

// =============================================================================
// States
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EntryState {
    /// A read fetch is in flight; the value is not yet usable.
    FetchingRead = 0,
    /// Cached for read.
    Readable = 1,
    /// Cached for read with an upgrade in flight.
    FetchingUpgrade = 2,
    /// Cached for write.
    Writable = 3,
    /// A downgrade to read is in flight; still readable.
    Downgrading = 4,
    /// An evict is in flight; unusable until acknowledged.
    Decaching = 5,
    /// Terminal. The key may be re-cached only after the entry leaves the
    /// table.
    Decached = 6,
}

impl EntryState {
    fn from_u8(value: u8) -> EntryState {
        match value {
            0 => EntryState::FetchingRead,
            1 => EntryState::Readable,
            2 => EntryState::FetchingUpgrade,
            3 => EntryState::Writable,
            4 => EntryState::Downgrading,
            5 => EntryState::Decaching,
            _ => EntryState::Decached,
        }
    }
}

/// Outcome of waiting for write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitWritable {
    /// The entry left the cache; the caller should retry from lookup.
    Decached,
    /// Readable only; the caller must upgrade.
    Readable,
    Writable,
}

/// What is known about a name when recording range information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingState {
    Bound,
    Unbound,
    Unknown,
}

// =============================================================================
// Shared entry core
// =============================================================================

/// State common to object and binding entries.
pub(crate) struct EntryCore {
    state: AtomicU8,
    modified: AtomicBool,
    context_id: AtomicU64,
}

impl EntryCore {
    fn new(state: EntryState, context_id: u64) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
            modified: AtomicBool::new(false),
            context_id: AtomicU64::new(context_id),
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, stripe: &Stripe, state: EntryState) {
        debug_assert!(stripe.mutex.is_locked());
        self.state.store(state as u8, Ordering::Release);
        stripe.notify_all();
    }

    /// Readable in the wide sense: the cached value is current.
    pub(crate) fn readable(&self) -> bool {
        matches!(
            self.state(),
            EntryState::Readable
                | EntryState::FetchingUpgrade
                | EntryState::Writable
                | EntryState::Downgrading
        )
    }

    pub(crate) fn writable(&self) -> bool {
        self.state() == EntryState::Writable
    }

    pub(crate) fn reading(&self) -> bool {
        self.state() == EntryState::FetchingRead
    }

    pub(crate) fn upgrading(&self) -> bool {
        self.state() == EntryState::FetchingUpgrade
    }

    pub(crate) fn downgrading(&self) -> bool {
        self.state() == EntryState::Downgrading
    }

    pub(crate) fn decaching(&self) -> bool {
        self.state() == EntryState::Decaching
    }

    pub(crate) fn decached(&self) -> bool {
        self.state() == EntryState::Decached
    }

    pub(crate) fn modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub(crate) fn set_modified(&self) {
        self.modified.store(true, Ordering::Release);
    }

    pub(crate) fn clear_modified(&self) {
        self.modified.store(false, Ordering::Release);
    }

    pub(crate) fn context_id(&self) -> u64 {
        self.context_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_context_id(&self, context_id: u64) {
        self.context_id.store(context_id, Ordering::Release);
    }

    // -- Waits ---------------------------------------------------------------

    fn check_deadline(&self, started: Instant, stop: Instant) -> Result<()> {
        if Instant::now() >= stop {
            return Err(JaalError::TxnTimeout {
                waited: started.elapsed(),
            });
        }
        Ok(())
    }

    /// Waits until the entry is readable. Returns `false` if the entry was
    /// decached, which tells the caller to retry from lookup.
    pub(crate) fn await_readable(
        &self,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        stop: Instant,
    ) -> Result<bool> {
        let started = Instant::now();
        loop {
            match self.state() {
                EntryState::Readable
                | EntryState::FetchingUpgrade
                | EntryState::Writable
                | EntryState::Downgrading => return Ok(true),
                EntryState::Decached => return Ok(false),
                EntryState::FetchingRead | EntryState::Decaching => {
                    self.check_deadline(started, stop)?;
                    stripe.cond.wait_until(guard, stop);
                }
            }
        }
    }

    /// Waits until the entry is writable, readable, or decached.
    pub(crate) fn await_writable(
        &self,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        stop: Instant,
    ) -> Result<AwaitWritable> {
        let started = Instant::now();
        loop {
            match self.state() {
                EntryState::Writable => return Ok(AwaitWritable::Writable),
                EntryState::Readable => return Ok(AwaitWritable::Readable),
                EntryState::Decached => return Ok(AwaitWritable::Decached),
                EntryState::FetchingRead
                | EntryState::FetchingUpgrade
                | EntryState::Downgrading
                | EntryState::Decaching => {
                    self.check_deadline(started, stop)?;
                    stripe.cond.wait_until(guard, stop);
                }
            }
        }
    }

    pub(crate) fn await_not_upgrading(
        &self,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        stop: Instant,
    ) -> Result<()> {
        let started = Instant::now();
        while self.upgrading() {
            self.check_deadline(started, stop)?;
            stripe.cond.wait_until(guard, stop);
        }
        Ok(())
    }

    // -- Transitions ---------------------------------------------------------

    /// The fetched value was installed for read.
    pub(crate) fn set_cached_read(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::FetchingRead);
        self.set_state(stripe, EntryState::Readable);
    }

    /// The fetched value was installed for write.
    pub(crate) fn set_cached_write(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::FetchingRead);
        self.set_state(stripe, EntryState::Writable);
    }

    /// An upgrade request is now in flight.
    pub(crate) fn set_fetching_upgrade(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::Readable);
        self.set_state(stripe, EntryState::FetchingUpgrade);
    }

    /// The server granted write access, with or without an upgrade request
    /// in flight.
    pub(crate) fn set_upgraded(&self, stripe: &Stripe) {
        debug_assert!(matches!(
            self.state(),
            EntryState::FetchingUpgrade | EntryState::Readable
        ));
        self.set_state(stripe, EntryState::Writable);
    }

    /// An upgrade request failed; back to plain readable.
    pub(crate) fn set_upgrade_abandoned(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::FetchingUpgrade);
        self.set_state(stripe, EntryState::Readable);
    }

    /// An evict is now in flight to the server.
    pub(crate) fn set_evicting(&self, stripe: &Stripe) {
        debug_assert!(matches!(
            self.state(),
            EntryState::Readable | EntryState::Writable
        ));
        self.set_state(stripe, EntryState::Decaching);
    }

    /// The server acknowledged the evict.
    pub(crate) fn set_evicted(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::Decaching);
        self.set_state(stripe, EntryState::Decached);
    }

    /// Evicted without a server call; legal only when the server already
    /// knows (callbacks) or never knew (abandoned fetches).
    pub(crate) fn set_evicted_immediate(&self, stripe: &Stripe) {
        debug_assert!(matches!(
            self.state(),
            EntryState::Readable | EntryState::Writable
        ));
        self.set_state(stripe, EntryState::Decached);
    }

    /// A fetch was abandoned before a value arrived.
    pub(crate) fn set_evicted_abandon_fetching(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::FetchingRead);
        self.set_state(stripe, EntryState::Decached);
    }

    /// A downgrade is now in flight to the server.
    pub(crate) fn set_evicting_downgrade(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::Writable);
        self.set_state(stripe, EntryState::Downgrading);
    }

    /// The server acknowledged the downgrade.
    pub(crate) fn set_evicted_downgrade(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::Downgrading);
        self.clear_modified();
        self.set_state(stripe, EntryState::Readable);
    }

    /// Downgraded without a server round trip, in response to a callback.
    pub(crate) fn set_evicted_downgrade_immediate(&self, stripe: &Stripe) {
        debug_assert_eq!(self.state(), EntryState::Writable);
        self.clear_modified();
        self.set_state(stripe, EntryState::Readable);
    }
}

// =============================================================================
// Object entries
// =============================================================================

/// A cached object. The value is the opaque object bytes; `None` means the
/// object does not exist (never created, or removed).
pub(crate) struct ObjectEntry {
    pub(crate) oid: ObjectId,
    pub(crate) core: EntryCore,
    value: Mutex<Option<Vec<u8>>>,
}

impl ObjectEntry {
    /// Entry reserved for a fetch in flight.
    pub(crate) fn fetching(oid: ObjectId, context_id: u64) -> Self {
        Self {
            oid,
            core: EntryCore::new(EntryState::FetchingRead, context_id),
            value: Mutex::new(None),
        }
    }

    /// Entry for an object id freshly allocated by the local node. Writable
    /// with no value until the transaction stores one.
    pub(crate) fn created(oid: ObjectId, context_id: u64) -> Self {
        Self {
            oid,
            core: EntryCore::new(EntryState::Writable, context_id),
            value: Mutex::new(None),
        }
    }

    /// Entry installed directly with a known value, cached for read.
    pub(crate) fn cached(oid: ObjectId, data: Option<Vec<u8>>, context_id: u64) -> Self {
        Self {
            oid,
            core: EntryCore::new(EntryState::Readable, context_id),
            value: Mutex::new(data),
        }
    }

    pub(crate) fn value(&self) -> Option<Vec<u8>> {
        self.value.lock().clone()
    }

    pub(crate) fn has_value(&self) -> bool {
        self.value.lock().is_some()
    }

    pub(crate) fn set_value(&self, data: Option<Vec<u8>>) {
        *self.value.lock() = data;
    }
}

// =============================================================================
// Binding entries
// =============================================================================

struct PreviousKey {
    key: Option<BindingKey>,
    unbound: bool,
}

/// A cached binding, plus the unbound-range certificate for the interval
/// below it.
pub(crate) struct BindingEntry {
    pub(crate) key: BindingKey,
    pub(crate) core: EntryCore,
    /// Bound object id, or -1 when the name is unbound.
    value: AtomicI64,
    pending_previous: AtomicBool,
    previous: Mutex<PreviousKey>,
}

impl BindingEntry {
    /// Entry reserved for a fetch in flight. Used for the provisional LAST
    /// entry created while asking the server about an uncovered name.
    pub(crate) fn fetching(key: BindingKey, context_id: u64) -> Self {
        Self {
            key,
            core: EntryCore::new(EntryState::FetchingRead, context_id),
            value: AtomicI64::new(-1),
            pending_previous: AtomicBool::new(false),
            previous: Mutex::new(PreviousKey {
                key: None,
                unbound: false,
            }),
        }
    }

    /// Entry installed with a known value.
    pub(crate) fn cached(
        key: BindingKey,
        oid: Option<ObjectId>,
        for_write: bool,
        context_id: u64,
    ) -> Self {
        let state = if for_write {
            EntryState::Writable
        } else {
            EntryState::Readable
        };
        Self {
            key,
            core: EntryCore::new(state, context_id),
            value: AtomicI64::new(oid.map_or(-1, |o| o as i64)),
            pending_previous: AtomicBool::new(false),
            previous: Mutex::new(PreviousKey {
                key: None,
                unbound: false,
            }),
        }
    }

    pub(crate) fn value(&self) -> Option<ObjectId> {
        let v = self.value.load(Ordering::Acquire);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub(crate) fn set_value(&self, oid: Option<ObjectId>) {
        self.value
            .store(oid.map_or(-1, |o| o as i64), Ordering::Release);
    }

    // -- Pending previous ----------------------------------------------------

    pub(crate) fn pending_previous(&self) -> bool {
        self.pending_previous.load(Ordering::Acquire)
    }

    /// Claims the previous-key interval. The claim must be free.
    pub(crate) fn set_pending_previous(&self) {
        let was = self.pending_previous.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "previous-key interval already claimed");
    }

    pub(crate) fn set_not_pending_previous(&self, stripe: &Stripe) {
        debug_assert!(stripe.mutex.is_locked());
        self.pending_previous.store(false, Ordering::Release);
        stripe.notify_all();
    }

    pub(crate) fn await_not_pending_previous(
        &self,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        stop: Instant,
    ) -> Result<()> {
        let started = Instant::now();
        while self.pending_previous() {
            if Instant::now() >= stop {
                return Err(JaalError::TxnTimeout {
                    waited: started.elapsed(),
                });
            }
            stripe.cond.wait_until(guard, stop);
        }
        Ok(())
    }

    // -- Range information ---------------------------------------------------

    pub(crate) fn previous_key(&self) -> Option<BindingKey> {
        self.previous.lock().key.clone()
    }

    pub(crate) fn previous_key_unbound(&self) -> bool {
        self.previous.lock().unbound
    }

    pub(crate) fn previous_key_info(&self) -> (Option<BindingKey>, bool) {
        let previous = self.previous.lock();
        (previous.key.clone(), previous.unbound)
    }

    pub(crate) fn set_previous_key(&self, key: Option<BindingKey>, unbound: bool) {
        debug_assert!(key.as_ref().map_or(true, |k| *k < self.key));
        let mut previous = self.previous.lock();
        previous.key = key;
        previous.unbound = unbound;
    }

    /// Whether `name` is provably unbound from this entry's certificate:
    /// strictly inside `(previous_key, key)`, or equal to a previous key
    /// known to be unbound itself.
    pub(crate) fn known_unbound(&self, name: &BindingKey) -> bool {
        if *name >= self.key {
            return false;
        }
        let previous = self.previous.lock();
        match &previous.key {
            Some(p) => p < name || (previous.unbound && p == name),
            None => false,
        }
    }

    /// Whether this entry is the next entry for `name`: its certificate
    /// covers everything from `name` up to its own key.
    pub(crate) fn is_next_entry(&self, name: &BindingKey) -> bool {
        if *name >= self.key {
            return false;
        }
        let previous = self.previous.lock();
        match &previous.key {
            Some(p) => p <= name,
            None => false,
        }
    }

    /// Merges new knowledge about `name` into the certificate. Returns
    /// whether the certificate now accounts for `name`.
    pub(crate) fn update_previous_key(&self, name: &BindingKey, state: BindingState) -> bool {
        if *name >= self.key {
            return false;
        }
        let mut previous = self.previous.lock();
        match previous.key.clone() {
            None => {
                previous.key = Some(name.clone());
                previous.unbound = state == BindingState::Unbound;
                true
            }
            Some(p) => {
                use std::cmp::Ordering::*;
                match name.cmp(&p) {
                    Less => {
                        // Extends the certified range downward.
                        previous.key = Some(name.clone());
                        previous.unbound = state == BindingState::Unbound;
                        true
                    }
                    Equal => {
                        match state {
                            BindingState::Unbound => previous.unbound = true,
                            BindingState::Bound => previous.unbound = false,
                            BindingState::Unknown => {}
                        }
                        true
                    }
                    Greater => {
                        if state == BindingState::Bound {
                            // A name inside the certified range became
                            // bound; the range must shrink above it.
                            previous.key = Some(name.clone());
                            previous.unbound = false;
                        }
                        true
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_fetch_to_readable() {
        let stripe = Stripe::new();
        let entry = ObjectEntry::fetching(1, 10);
        let mut guard = stripe.lock();
        assert!(entry.core.reading());
        entry.core.set_cached_read(&stripe);
        assert!(entry.core.await_readable(&stripe, &mut guard, far()).unwrap());
        assert!(!entry.core.writable());
    }

    #[test]
    fn test_upgrade_cycle() {
        let stripe = Stripe::new();
        let entry = ObjectEntry::fetching(1, 10);
        let _guard = stripe.lock();
        entry.core.set_cached_read(&stripe);
        entry.core.set_fetching_upgrade(&stripe);
        assert!(entry.core.upgrading());
        assert!(entry.core.readable());
        entry.core.set_upgraded(&stripe);
        assert!(entry.core.writable());
        entry.core.set_evicting_downgrade(&stripe);
        assert!(entry.core.readable());
        entry.core.set_evicted_downgrade(&stripe);
        assert!(!entry.core.writable());
        assert!(entry.core.readable());
    }

    #[test]
    fn test_await_readable_times_out() {
        let stripe = Stripe::new();
        let entry = ObjectEntry::fetching(1, 10);
        let mut guard = stripe.lock();
        let stop = Instant::now() + Duration::from_millis(20);
        let err = entry
            .core
            .await_readable(&stripe, &mut guard, stop)
            .unwrap_err();
        assert!(matches!(err, JaalError::TxnTimeout { .. }));
    }

    #[test]
    fn test_await_readable_wakes_on_install() {
        let stripe = Arc::new(Stripe::new());
        let entry = Arc::new(ObjectEntry::fetching(1, 10));

        let installer = {
            let stripe = Arc::clone(&stripe);
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let _guard = stripe.lock();
                entry.set_value(Some(vec![1]));
                entry.core.set_cached_read(&stripe);
            })
        };

        let mut guard = stripe.lock();
        assert!(entry.core.await_readable(&stripe, &mut guard, far()).unwrap());
        drop(guard);
        installer.join().unwrap();
        assert_eq!(entry.value(), Some(vec![1]));
    }

    #[test]
    fn test_await_writable_trichotomy() {
        let stripe = Stripe::new();
        let mut guard = stripe.lock();

        let entry = BindingEntry::cached(BindingKey::for_name("a"), Some(1), false, 5);
        assert_eq!(
            entry.core.await_writable(&stripe, &mut guard, far()).unwrap(),
            AwaitWritable::Readable
        );

        entry.core.set_fetching_upgrade(&stripe);
        entry.core.set_upgraded(&stripe);
        assert_eq!(
            entry.core.await_writable(&stripe, &mut guard, far()).unwrap(),
            AwaitWritable::Writable
        );

        entry.core.set_evicting(&stripe);
        entry.core.set_evicted(&stripe);
        assert_eq!(
            entry.core.await_writable(&stripe, &mut guard, far()).unwrap(),
            AwaitWritable::Decached
        );
    }

    #[test]
    fn test_known_unbound_range() {
        let entry = BindingEntry::cached(BindingKey::for_name("m"), Some(1), false, 5);
        let b = BindingKey::for_name("b");
        let f = BindingKey::for_name("f");
        let m = BindingKey::for_name("m");
        let z = BindingKey::for_name("z");

        // No certificate yet.
        assert!(!entry.known_unbound(&f));
        assert!(!entry.is_next_entry(&f));

        assert!(entry.update_previous_key(&b, BindingState::Unknown));
        assert!(entry.known_unbound(&f));
        assert!(!entry.known_unbound(&b));
        assert!(entry.is_next_entry(&b));
        assert!(!entry.known_unbound(&m));
        assert!(!entry.known_unbound(&z));

        // Marking the previous key itself unbound covers the endpoint.
        assert!(entry.update_previous_key(&b, BindingState::Unbound));
        assert!(entry.known_unbound(&b));
    }

    #[test]
    fn test_update_previous_key_shrinks_on_bound() {
        let entry = BindingEntry::cached(BindingKey::for_name("m"), Some(1), false, 5);
        entry.update_previous_key(&BindingKey::First, BindingState::Unbound);
        assert!(entry.known_unbound(&BindingKey::for_name("f")));

        // "f" became bound: the certificate must no longer cover names
        // below it.
        entry.update_previous_key(&BindingKey::for_name("f"), BindingState::Bound);
        assert!(!entry.known_unbound(&BindingKey::for_name("c")));
        assert!(entry.known_unbound(&BindingKey::for_name("g")));
        assert!(!entry.known_unbound(&BindingKey::for_name("f")));
    }

    #[test]
    fn test_pending_previous_wait() {
        let stripe = Arc::new(Stripe::new());
        let entry = Arc::new(BindingEntry::cached(
            BindingKey::for_name("k"),
            Some(1),
            false,
            5,
        ));
        entry.set_pending_previous();

        let releaser = {
            let stripe = Arc::clone(&stripe);
            let entry = Arc::clone(&entry);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                let _guard = stripe.lock();
                entry.set_not_pending_previous(&stripe);
            })
        };

        let mut guard = stripe.lock();
        entry
            .await_not_pending_previous(&stripe, &mut guard, far())
            .unwrap();
        drop(guard);
        releaser.join().unwrap();
        assert!(!entry.pending_previous());
    }
}
