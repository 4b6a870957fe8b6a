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

//! The caching data store facade.
//!
//! [`CachingStore`] implements every externally visible operation: object
//! reads and writes, the four binding operations with their range proofs,
//! transaction prepare/commit/abort, and the server-initiated evict and
//! downgrade callbacks.
//!
//! The operations share one shape: look the entry up under its stripe
//! lock, wait for the state the operation needs, and if the cache cannot
//! answer, reserve an entry, hand the server call to the fetch pool, and
//! wait for the completion to change entry state. Lookup loops retry when
//! an entry decaches or the binding index shifts underneath them; a
//! liveness guard converts a loop that stops making progress into a
//! reported failure instead of a hang.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{info, trace, warn};

use jaaldb_core::{
    run_io, BindingKey, CheckLevel, JaalError, ObjectId, Result, RetryPolicy, StoreConfig,
};
use jaaldb_net::{
    CallbackHandler, CallbackListener, RemoteStoreServer, RemoteUpdateSender, StoreServer,
    UpdateSender,
};

use crate::context::{TxnContext, TxnContextMap};
use crate::entry::{
    AwaitWritable, BindingEntry, BindingState, EntryState, ObjectEntry, Stripe,
};
use crate::evictor::{self, FullFlag};
use crate::oid::NewObjectIdCache;
use crate::pool::WorkerPool;
use crate::queue::UpdateQueue;
use crate::table::{AnyEntry, Cache, CacheReservation};
use crate::{AccessKind, AccessReporter, NoopAccessReporter, TxnId, Watchdog};

/// Liveness guard for the lookup loops. Exceeding it means an operation is
/// spinning without progress, which is an internal bug, not load.
const MAX_OPERATION_RETRIES: u32 = 1000;

// =============================================================================
// Results
// =============================================================================

/// Result of a binding operation.
///
/// `oid` is the bound object id, or `-1` when the name is (or was) unbound.
/// Write operations report the prior state: `1` for "was already bound".
/// `next_name` carries the next bound name when one is known; `None` either
/// means no higher name exists or none was supplied, matching the wire
/// contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingValue {
    pub oid: i64,
    pub next_name: Option<String>,
}

impl BindingValue {
    fn from_value(value: Option<ObjectId>) -> Self {
        Self {
            oid: value.map_or(-1, |oid| oid as i64),
            next_name: None,
        }
    }

    fn was_bound(next_name: Option<String>) -> Self {
        Self {
            oid: 1,
            next_name,
        }
    }

    fn unbound(next_name: Option<String>) -> Self {
        Self {
            oid: -1,
            next_name,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.oid >= 0
    }

    pub fn oid(&self) -> Option<ObjectId> {
        if self.oid >= 0 {
            Some(self.oid as u64)
        } else {
            None
        }
    }
}

// =============================================================================
// Shutdown gate
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    NotRequested,
    Requested,
    TxnsCompleted,
    Completed,
}

struct GateState {
    state: ShutdownState,
    txn_count: usize,
}

struct ShutdownGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ShutdownGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                state: ShutdownState::NotRequested,
                txn_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn txn_started(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.state != ShutdownState::NotRequested {
            return Err(JaalError::Shutdown);
        }
        state.txn_count += 1;
        Ok(())
    }

    fn txn_finished(&self) {
        let mut state = self.state.lock();
        state.txn_count = state.txn_count.saturating_sub(1);
        if state.state == ShutdownState::Requested && state.txn_count == 0 {
            self.cond.notify_all();
        }
    }

    /// First caller drives the shutdown; later callers wait for it.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.state == ShutdownState::NotRequested {
            state.state = ShutdownState::Requested;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }

    fn await_txns_completed(&self) {
        let mut state = self.state.lock();
        loop {
            match state.state {
                ShutdownState::Requested => {
                    if state.txn_count == 0 {
                        state.state = ShutdownState::TxnsCompleted;
                        self.cond.notify_all();
                        return;
                    }
                    self.cond.wait(&mut state);
                }
                ShutdownState::TxnsCompleted | ShutdownState::Completed => return,
                ShutdownState::NotRequested => {
                    debug_assert!(false, "waiting for transactions without a shutdown request");
                    return;
                }
            }
        }
    }

    fn await_completed(&self) {
        let mut state = self.state.lock();
        while state.state != ShutdownState::Completed {
            self.cond.wait(&mut state);
        }
    }

    fn set_completed(&self) {
        let mut state = self.state.lock();
        state.state = ShutdownState::Completed;
        self.cond.notify_all();
    }

    fn txns_completed(&self) -> bool {
        matches!(
            self.state.lock().state,
            ShutdownState::TxnsCompleted | ShutdownState::Completed
        )
    }
}

// =============================================================================
// Store internals
// =============================================================================

struct WatchdogState {
    watchdog: Option<Arc<dyn Watchdog>>,
    failure_before: Option<String>,
}

/// Deferred evict and downgrade work, run on the task pool and requeued
/// until the target entry is quiescent.
#[derive(Debug, Clone)]
enum StoreTask {
    EvictObject(ObjectId),
    DowngradeObject(ObjectId),
    EvictBinding(BindingKey),
    DowngradeBinding(BindingKey),
}

/// Which server call a binding fetch makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingCall {
    Read,
    Update,
    Remove,
    NextName,
}

/// A binding fetch result, normalized across the four server calls so one
/// handler can apply it to the cache.
struct BindingFetch {
    name_state: BindingState,
    name_oid: Option<ObjectId>,
    name_for_write: bool,
    server_next_key: Option<BindingKey>,
    server_next_oid: Option<ObjectId>,
    next_for_write: bool,
    callback_evict: bool,
    callback_downgrade: bool,
    next_callback_evict: bool,
    next_callback_downgrade: bool,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    node_id: u64,
    server: Arc<dyn StoreServer>,
    pub(crate) cache: Cache,
    queue: UpdateQueue,
    contexts: TxnContextMap,
    oid_cache: NewObjectIdCache,
    fetch_pool: WorkerPool,
    task_pool: WorkerPool,
    retry: RetryPolicy,
    shutdown_gate: ShutdownGate,
    pub(crate) pending_evictions: AtomicUsize,
    failed: AtomicBool,
    watchdog: Mutex<WatchdogState>,
    access: Arc<dyn AccessReporter>,
    pub(crate) full_flag: Arc<FullFlag>,
    evictor_thread: Mutex<Option<JoinHandle<()>>>,
    callback_listener: Mutex<Option<CallbackListener>>,
}

/// The caching data store for one node.
#[derive(Clone)]
pub struct CachingStore {
    inner: Arc<StoreInner>,
}

impl CachingStore {
    /// Builds a store over an already registered node: the server handle,
    /// update-queue sender, and node id come from the caller. This is the
    /// constructor embedders and tests use; [`CachingStore::connect`] wires
    /// the TCP endpoints.
    pub fn new(
        config: StoreConfig,
        server: Arc<dyn StoreServer>,
        update_sender: Arc<dyn UpdateSender>,
        node_id: u64,
    ) -> Result<Self> {
        Self::with_access_reporter(
            config,
            server,
            update_sender,
            node_id,
            Arc::new(NoopAccessReporter),
        )
    }

    pub fn with_access_reporter(
        config: StoreConfig,
        server: Arc<dyn StoreServer>,
        update_sender: Arc<dyn UpdateSender>,
        node_id: u64,
        access: Arc<dyn AccessReporter>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            node_id,
            cache_size = config.cache_size,
            eviction_batch_size = config.eviction_batch_size,
            eviction_reserve_size = config.eviction_reserve_size,
            num_locks = config.num_locks,
            update_queue_size = config.update_queue_size,
            "creating caching data store"
        );
        let retry = RetryPolicy::new(config.max_retry, config.retry_wait);
        let full_flag = Arc::new(FullFlag::new());
        let cache = Cache::new(config.cache_size, config.num_locks, Arc::clone(&full_flag));
        let oid_cache = NewObjectIdCache::new(config.object_id_batch_size);
        let fetch_pool = WorkerPool::new("jaaldb-fetch", config.fetch_threads);
        let task_pool = WorkerPool::new("jaaldb-task", config.task_threads);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<StoreInner>| {
            let failure_weak = weak.clone();
            let on_failure: Arc<dyn Fn(JaalError) + Send + Sync> = Arc::new(move |err| {
                if let Some(store) = failure_weak.upgrade() {
                    store.report_failure(&err);
                }
            });
            let settled_weak = weak.clone();
            let on_settled: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                if let Some(store) = settled_weak.upgrade() {
                    store.cache.notify_all_stripes();
                }
            });
            let queue = UpdateQueue::new(
                node_id,
                config.update_queue_size,
                update_sender,
                retry,
                on_failure,
                on_settled,
            );
            StoreInner {
                config,
                node_id,
                server,
                cache,
                queue,
                contexts: TxnContextMap::new(),
                oid_cache,
                fetch_pool,
                task_pool,
                retry,
                shutdown_gate: ShutdownGate::new(),
                pending_evictions: AtomicUsize::new(0),
                failed: AtomicBool::new(false),
                watchdog: Mutex::new(WatchdogState {
                    watchdog: None,
                    failure_before: None,
                }),
                access,
                full_flag,
                evictor_thread: Mutex::new(None),
                callback_listener: Mutex::new(None),
            }
        });

        let evictor_store = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("jaaldb-evictor".to_string())
            .spawn(move || evictor::run(evictor_store))?;
        *inner.evictor_thread.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// Registers this node with the configured server, opens the
    /// update-queue connection, and starts the callback listener.
    pub fn connect(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::new(config.max_retry, config.retry_wait);
        let server = Arc::new(RemoteStoreServer::new(
            config.server_host.clone(),
            config.server_port,
        ));
        let registration = run_io(&retry, || server.register_node(config.callback_port))?;
        info!(
            node_id = registration.node_id,
            update_queue_port = registration.update_queue_port,
            "registered with the data store server"
        );
        let update_sender = Arc::new(RemoteUpdateSender::new(
            config.server_host.clone(),
            registration.update_queue_port,
        ));
        let callback_port = config.callback_port;
        let store = Self::new(config, server, update_sender, registration.node_id)?;
        let listener = CallbackListener::spawn(callback_port, Arc::new(store.clone()))?;
        *store.inner.callback_listener.lock() = Some(listener);
        Ok(store)
    }

    pub fn local_node_id(&self) -> u64 {
        self.inner.node_id
    }

    /// Number of entries currently cached.
    pub fn cached_entry_count(&self) -> usize {
        self.inner.cache.entry_count()
    }

    /// Installs the watchdog. A failure recorded before installation is
    /// delivered immediately.
    pub fn set_watchdog(&self, watchdog: Arc<dyn Watchdog>) {
        let pending = {
            let mut state = self.inner.watchdog.lock();
            state.watchdog = Some(Arc::clone(&watchdog));
            state.failure_before.take()
        };
        if pending.is_some() {
            let node_id = self.inner.node_id;
            let result = thread::Builder::new()
                .name("jaaldb-report-failure".to_string())
                .spawn(move || watchdog.report_failure(node_id, "jaaldb-store"));
            if result.is_err() {
                warn!("could not spawn the failure report thread");
            }
        }
    }

    // -- Transactions --------------------------------------------------------

    /// Starts a transaction with the given stop-time budget. Rejected once
    /// shutdown has been requested.
    pub fn create_transaction(&self, timeout: Duration) -> Result<TxnId> {
        self.inner.shutdown_gate.txn_started()?;
        let context = self.inner.contexts.create(Instant::now() + timeout);
        self.inner.queue.note_context_started(context.context_id);
        trace!(txn = %context.txn_id(), "transaction started");
        Ok(context.txn_id())
    }

    /// Validates the transaction without I/O. Returns whether it is
    /// read-only.
    pub fn prepare(&self, txn: TxnId) -> Result<bool> {
        let context = self.inner.contexts.join(txn)?;
        context.prepare(&self.inner.cache)
    }

    /// Ships the transaction's writes as one atomic batch and finishes it.
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        let inner = &self.inner;
        let context = inner.contexts.remove(txn)?;
        let result = context
            .ensure_prepared(&inner.cache)
            .and_then(|_| context.commit(&inner.cache, &inner.queue));
        match result {
            Ok(()) => {
                inner.shutdown_gate.txn_finished();
                inner.maybe_check_bindings(CheckLevel::Txn);
                trace!(txn = %txn, "transaction committed");
                Ok(())
            }
            Err(err) => {
                context.abort(&inner.cache, &inner.queue);
                inner.shutdown_gate.txn_finished();
                Err(err)
            }
        }
    }

    pub fn prepare_and_commit(&self, txn: TxnId) -> Result<()> {
        self.commit(txn)
    }

    /// Discards the transaction's modifications and reservations. Cached
    /// reads stay in place.
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        let inner = &self.inner;
        let context = inner.contexts.remove(txn)?;
        context.abort(&inner.cache, &inner.queue);
        inner.shutdown_gate.txn_finished();
        inner.maybe_check_bindings(CheckLevel::Txn);
        trace!(txn = %txn, "transaction aborted");
        Ok(())
    }

    // -- Objects -------------------------------------------------------------

    /// Allocates a fresh object id from the locally cached batch.
    pub fn create_object(&self, txn: TxnId) -> Result<ObjectId> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        inner.check_failed()?;
        let oid = loop {
            if let Some(oid) = inner.oid_cache.try_take() {
                break oid;
            }
            if inner.oid_cache.begin_fetch() {
                inner.spawn_object_id_fetch();
            }
            inner.oid_cache.await_available(context.stop_time)?;
        };
        if inner.oid_cache.should_prefetch() && inner.oid_cache.begin_fetch() {
            inner.spawn_object_id_fetch();
        }
        let mut reservation = inner.cache.reserve(1);
        let stripe = inner.cache.object_stripe(oid);
        let _guard = stripe.lock();
        context.note_new_object(&inner.cache, oid, &mut reservation);
        trace!(txn = %txn, oid, "created object");
        Ok(oid)
    }

    /// Fetches an object's bytes, for read or for update.
    pub fn get_object(&self, txn: TxnId, oid: ObjectId, for_update: bool) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        let stop = context.stop_time;
        let mut attempts = 0u32;
        let mut reservation: Option<CacheReservation> = None;
        let stripe = inner.cache.object_stripe(oid);
        let mut guard = stripe.lock();
        let value = loop {
            inner.retry_guard(&mut attempts)?;
            inner.check_failed()?;
            let entry = match inner.cache.get_object_entry(oid) {
                Some(entry) => entry,
                None => match reservation.as_mut().filter(|res| res.unused() > 0) {
                    Some(res) => {
                        let entry = context.note_fetching_object(&inner.cache, oid, res);
                        inner.spawn_object_fetch(Arc::clone(&context), oid, for_update);
                        entry
                    }
                    None => {
                        drop(guard);
                        reservation = Some(inner.cache.reserve(1));
                        guard = stripe.lock();
                        continue;
                    }
                },
            };
            if !for_update {
                if !entry.core.await_readable(stripe, &mut guard, stop)? {
                    continue;
                }
            } else {
                match entry.core.await_writable(stripe, &mut guard, stop)? {
                    AwaitWritable::Decached => continue,
                    AwaitWritable::Readable => {
                        entry.core.set_fetching_upgrade(stripe);
                        inner.spawn_object_upgrade(Arc::clone(&context), oid);
                        match entry.core.await_writable(stripe, &mut guard, stop)? {
                            AwaitWritable::Writable => {}
                            _ => continue,
                        }
                    }
                    AwaitWritable::Writable => {}
                }
            }
            context.note_object_access(&entry);
            break entry.value();
        };
        drop(guard);
        drop(reservation);
        match value {
            Some(data) => Ok(data),
            None => Err(JaalError::ObjectNotFound(oid)),
        }
    }

    /// Upgrades an object to write access without returning its value.
    pub fn mark_for_update(&self, txn: TxnId, oid: ObjectId) -> Result<()> {
        let context = self.inner.contexts.join(txn)?;
        self.inner.with_writable_object(&context, oid, |_entry| Ok(()))
    }

    pub fn set_object(&self, txn: TxnId, oid: ObjectId, data: &[u8]) -> Result<()> {
        self.set_object_internal(txn, oid, Some(data.to_vec()))
    }

    pub fn set_objects(&self, txn: TxnId, updates: &[(ObjectId, Vec<u8>)]) -> Result<()> {
        for (oid, data) in updates {
            self.set_object(txn, *oid, data)?;
        }
        Ok(())
    }

    /// Removes an object by storing a tombstone.
    pub fn remove_object(&self, txn: TxnId, oid: ObjectId) -> Result<()> {
        self.set_object_internal(txn, oid, None)
    }

    fn set_object_internal(
        &self,
        txn: TxnId,
        oid: ObjectId,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        let context = self.inner.contexts.join(txn)?;
        let modifier = Arc::clone(&context);
        self.inner.with_writable_object(&context, oid, move |entry| {
            if data.is_none() && !entry.has_value() {
                return Err(JaalError::ObjectNotFound(oid));
            }
            modifier.note_modified_object(entry, data);
            Ok(())
        })
    }

    /// The next object id above `oid` that refers to an existing object,
    /// merging server state with ids created in this transaction.
    pub fn next_object_id(&self, txn: TxnId, oid: Option<ObjectId>) -> Result<Option<ObjectId>> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        inner.check_failed()?;
        let next_new = context.next_new_object_id(oid);
        let mut last = oid;
        loop {
            let results = match inner.server.next_object_id(inner.node_id, last) {
                Ok(results) => results,
                Err(JaalError::Io(err)) => return Err(JaalError::Network(err.to_string())),
                Err(err) => return Err(err),
            };
            if let Some(results) = &results {
                if results.callback_evict {
                    inner.schedule_task(StoreTask::EvictObject(results.oid));
                }
            }
            let Some(results) = results else {
                return Ok(next_new);
            };
            if let Some(next_new_oid) = next_new {
                if results.oid > next_new_oid {
                    return Ok(Some(next_new_oid));
                }
            }
            let stripe = inner.cache.object_stripe(results.oid);
            let _guard = stripe.lock();
            match inner.cache.get_object_entry(results.oid) {
                None => {
                    if let Some(mut reservation) = inner.cache.try_reserve(1) {
                        context.note_cached_object_value(
                            &inner.cache,
                            results.oid,
                            results.data.clone(),
                            &mut reservation,
                        );
                    }
                    return Ok(Some(results.oid));
                }
                Some(entry) => {
                    if entry.has_value() {
                        context.note_object_access(&entry);
                        return Ok(Some(results.oid));
                    }
                    // Removed locally; keep walking.
                    last = Some(results.oid);
                }
            }
        }
    }

    // -- Class registry ------------------------------------------------------

    pub fn get_class_id(&self, txn: TxnId, info: &[u8]) -> Result<u32> {
        let inner = &self.inner;
        inner.contexts.join(txn)?;
        inner.check_failed()?;
        match inner.server.get_class_id(inner.node_id, info) {
            Err(JaalError::Io(err)) => Err(JaalError::Network(err.to_string())),
            other => other,
        }
    }

    pub fn get_class_info(&self, txn: TxnId, class_id: u32) -> Result<Vec<u8>> {
        let inner = &self.inner;
        inner.contexts.join(txn)?;
        inner.check_failed()?;
        match inner.server.get_class_info(inner.node_id, class_id) {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(JaalError::ClassInfoNotFound(class_id)),
            Err(JaalError::Io(err)) => Err(JaalError::Network(err.to_string())),
            Err(err) => Err(err),
        }
    }

    // -- Bindings ------------------------------------------------------------

    /// Looks a name up, caching the answer either way: a hit caches the
    /// binding, a miss extends the next entry's unbound-range certificate
    /// so the absence is provable locally next time.
    pub fn get_binding(&self, txn: TxnId, name: &str) -> Result<BindingValue> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        let stop = context.stop_time;
        let name_key = BindingKey::for_name(name);
        let mut attempts = 0u32;
        let mut reservation = inner.cache.reserve(1);
        let result = loop {
            inner.retry_guard(&mut attempts)?;
            inner.check_failed()?;
            if reservation.unused() == 0 {
                reservation = inner.cache.reserve(1);
            }
            let cached = inner.cache.ceiling_binding_entry(&name_key);
            let stripe_key = cached.as_ref().map_or(BindingKey::Last, |e| e.key.clone());
            let stripe = inner.cache.binding_stripe(&stripe_key);
            let mut guard = stripe.lock();
            trace!(txn = %txn, name, found = cached.is_some(), "get_binding");
            let entry = match cached {
                None => {
                    if inner.cache.get_binding_entry(&BindingKey::Last).is_some() {
                        continue;
                    }
                    context.note_last_binding(&inner.cache, &mut reservation)
                }
                Some(entry) => {
                    if !entry.core.await_readable(stripe, &mut guard, stop)? {
                        continue;
                    }
                    if name_key == entry.key {
                        context.note_binding_access(&entry);
                        break BindingValue::from_value(entry.value());
                    }
                    if !inner.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop)? {
                        continue;
                    }
                    if entry.known_unbound(&name_key) {
                        context.note_binding_access(&entry);
                        break BindingValue::unbound(entry.key.name_allow_last());
                    }
                    entry
                }
            };
            inner.call_server_for_binding(
                &context,
                stripe,
                &mut guard,
                &entry,
                &name_key,
                BindingCall::Read,
            )?;
            if entry.core.readable() && entry.known_unbound(&name_key) {
                context.note_binding_access(&entry);
                break BindingValue::unbound(entry.key.name_allow_last());
            }
            // Either a lower next entry appeared or the name is now bound.
        };
        inner.maybe_check_bindings(CheckLevel::Operation);
        Ok(result)
    }

    /// Binds a name, reporting whether it was bound before. Binding a new
    /// name requires proof of absence and a writable next entry, because
    /// carving the name out of the next entry's certificate is a write.
    pub fn set_binding(&self, txn: TxnId, name: &str, oid: ObjectId) -> Result<BindingValue> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        let stop = context.stop_time;
        let name_key = BindingKey::for_name(name);
        let mut attempts = 0u32;
        let mut reservation = inner.cache.reserve(1);
        let result = loop {
            inner.retry_guard(&mut attempts)?;
            inner.check_failed()?;
            if reservation.unused() == 0 {
                reservation = inner.cache.reserve(1);
            }
            let cached = inner.cache.ceiling_binding_entry(&name_key);
            let stripe_key = cached.as_ref().map_or(BindingKey::Last, |e| e.key.clone());
            let stripe = inner.cache.binding_stripe(&stripe_key);
            let mut guard = stripe.lock();
            trace!(txn = %txn, name, found = cached.is_some(), "set_binding");
            let next_entry = match cached {
                None => {
                    if inner.cache.get_binding_entry(&BindingKey::Last).is_some() {
                        continue;
                    }
                    let entry = context.note_last_binding(&inner.cache, &mut reservation);
                    inner.call_server_for_binding(
                        &context,
                        stripe,
                        &mut guard,
                        &entry,
                        &name_key,
                        BindingCall::Update,
                    )?;
                    continue;
                }
                Some(entry) if name_key == entry.key => {
                    if !inner.set_binding_found(&context, stripe, &mut guard, &entry)? {
                        continue;
                    }
                    context.note_modified_binding(&entry, Some(oid));
                    break BindingValue::was_bound(None);
                }
                Some(entry) => {
                    if !inner.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop)? {
                        continue;
                    }
                    if !entry.known_unbound(&name_key) {
                        inner.call_server_for_binding(
                            &context,
                            stripe,
                            &mut guard,
                            &entry,
                            &name_key,
                            BindingCall::Update,
                        )?;
                        continue;
                    }
                    if !inner.set_binding_unbound(&context, stripe, &mut guard, &entry, &name_key)? {
                        continue;
                    }
                    entry.set_pending_previous();
                    entry
                }
            };
            let (previous_key, previous_key_unbound) = next_entry.previous_key_info();
            drop(guard);

            // Create the entry for the new binding.
            {
                let name_stripe = inner.cache.binding_stripe(&name_key);
                let _name_guard = name_stripe.lock();
                let name_entry =
                    context.note_created_binding(&inner.cache, name_key.clone(), &mut reservation);
                context.note_modified_binding(&name_entry, Some(oid));
                if let Some(previous) = &previous_key {
                    if previous < &name_key {
                        name_entry.set_previous_key(Some(previous.clone()), previous_key_unbound);
                    }
                }
            }

            // Record the new binding in the next entry's certificate.
            inner
                .access
                .report_name_access(&next_entry.key, AccessKind::Write);
            {
                let next_stripe = inner.cache.binding_stripe(&next_entry.key);
                let _next_guard = next_stripe.lock();
                match inner.cache.get_binding_entry(&next_entry.key) {
                    Some(entry) => {
                        entry.set_not_pending_previous(next_stripe);
                        let value = entry.value();
                        context.note_modified_binding(&entry, value);
                        entry.update_previous_key(&name_key, BindingState::Bound);
                    }
                    None => {
                        inner.report_failure(&JaalError::CacheConsistency(format!(
                            "next entry {} vanished while pending previous",
                            next_entry.key
                        )));
                    }
                }
            }
            break BindingValue::unbound(next_entry.key.name_allow_last());
        };
        inner.maybe_check_bindings(CheckLevel::Operation);
        Ok(result)
    }

    /// Unbinds a name. Requires write access to both the name's entry and
    /// its successor, target first, successor claimed through the
    /// pending-previous token.
    pub fn remove_binding(&self, txn: TxnId, name: &str) -> Result<BindingValue> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        let stop = context.stop_time;
        let name_key = BindingKey::for_name(name);
        let mut attempts = 0u32;
        let mut reservation = inner.cache.reserve(1);
        let result = loop {
            inner.retry_guard(&mut attempts)?;
            inner.check_failed()?;
            if reservation.unused() == 0 {
                reservation = inner.cache.reserve(1);
            }
            let cached = inner.cache.ceiling_binding_entry(&name_key);
            let stripe_key = cached.as_ref().map_or(BindingKey::Last, |e| e.key.clone());
            let stripe = inner.cache.binding_stripe(&stripe_key);
            let mut guard = stripe.lock();
            trace!(txn = %txn, name, found = cached.is_some(), "remove_binding");
            let name_writable = match cached {
                None => {
                    if inner.cache.get_binding_entry(&BindingKey::Last).is_some() {
                        continue;
                    }
                    let entry = context.note_last_binding(&inner.cache, &mut reservation);
                    inner.call_server_for_binding(
                        &context,
                        stripe,
                        &mut guard,
                        &entry,
                        &name_key,
                        BindingCall::Remove,
                    )?;
                    continue;
                }
                Some(entry) if name_key == entry.key => {
                    if !inner.remove_binding_found(stripe, &mut guard, &entry, stop)? {
                        continue;
                    }
                    if entry.core.readable() && entry.value().is_none() {
                        // Already removed, most likely by this transaction.
                        context.note_binding_access(&entry);
                        break BindingValue::unbound(None);
                    }
                    entry.core.writable()
                }
                Some(entry) => {
                    if !inner.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop)? {
                        continue;
                    }
                    if entry.known_unbound(&name_key) {
                        context.note_binding_access(&entry);
                        break BindingValue::unbound(entry.key.name_allow_last());
                    }
                    inner.call_server_for_binding(
                        &context,
                        stripe,
                        &mut guard,
                        &entry,
                        &name_key,
                        BindingCall::Remove,
                    )?;
                    continue;
                }
            };
            drop(guard);
            if let Some(value) = inner.remove_binding_check_next(
                &context,
                &name_key,
                name_writable,
                &mut reservation,
            )? {
                break value;
            }
        };
        inner.maybe_check_bindings(CheckLevel::Operation);
        Ok(result)
    }

    /// The next bound name strictly above `name`; `None` starts from the
    /// beginning of the namespace, and a `None` result means no higher
    /// bound name exists.
    pub fn next_bound_name(&self, txn: TxnId, name: Option<&str>) -> Result<Option<String>> {
        let inner = &self.inner;
        let context = inner.contexts.join(txn)?;
        let stop = context.stop_time;
        let name_key = BindingKey::allow_first(name);
        let mut attempts = 0u32;
        let mut reservation = inner.cache.reserve(1);
        let result = loop {
            inner.retry_guard(&mut attempts)?;
            inner.check_failed()?;
            if reservation.unused() == 0 {
                reservation = inner.cache.reserve(1);
            }
            let cached = inner.cache.higher_binding_entry(&name_key);
            let stripe_key = cached.as_ref().map_or(BindingKey::Last, |e| e.key.clone());
            let stripe = inner.cache.binding_stripe(&stripe_key);
            let mut guard = stripe.lock();
            trace!(txn = %txn, ?name, found = cached.is_some(), "next_bound_name");
            let entry = match cached {
                None => {
                    if inner.cache.get_binding_entry(&BindingKey::Last).is_some() {
                        continue;
                    }
                    context.note_last_binding(&inner.cache, &mut reservation)
                }
                Some(entry) => {
                    if !inner.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop)? {
                        continue;
                    }
                    if entry.is_next_entry(&name_key) {
                        context.note_binding_access(&entry);
                        break entry.key.name_allow_last();
                    }
                    entry
                }
            };
            inner.call_server_for_binding(
                &context,
                stripe,
                &mut guard,
                &entry,
                &name_key,
                BindingCall::NextName,
            )?;
            if entry.core.readable() && entry.is_next_entry(&name_key) {
                context.note_binding_access(&entry);
                break entry.key.name_allow_last();
            }
        };
        inner.maybe_check_bindings(CheckLevel::Operation);
        Ok(result)
    }

    /// Drains transactions, then stops the evictor, fetch pool, update
    /// queue, and callback listener, in that order. Later callers block
    /// until the first finishes.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutdown_gate.begin() {
            inner.shutdown_gate.await_completed();
            return;
        }
        info!("shutting down the caching data store");
        inner.shutdown_gate.await_txns_completed();
        inner.oid_cache.shutdown();
        inner.full_flag.signal();
        if let Some(handle) = inner.evictor_thread.lock().take() {
            let _ = handle.join();
        }
        inner.fetch_pool.shutdown();
        inner.queue.shutdown();
        if let Some(mut listener) = inner.callback_listener.lock().take() {
            listener.shutdown();
        }
        inner.task_pool.shutdown();
        inner.shutdown_gate.set_completed();
        info!("caching data store shut down");
    }
}

// =============================================================================
// Server-initiated callbacks
// =============================================================================

impl CallbackHandler for CachingStore {
    fn request_evict_object(&self, oid: ObjectId) -> bool {
        self.inner.evict_object_request(oid)
    }

    fn request_downgrade_object(&self, oid: ObjectId) -> bool {
        self.inner.downgrade_object_request(oid)
    }

    fn request_evict_binding(&self, key: BindingKey) -> bool {
        self.inner.evict_binding_request(key)
    }

    fn request_downgrade_binding(&self, key: BindingKey) -> bool {
        self.inner.downgrade_binding_request(key)
    }
}

// =============================================================================
// Internals
// =============================================================================

impl StoreInner {
    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(JaalError::Network("this node has failed".to_string()));
        }
        Ok(())
    }

    fn retry_guard(self: &Arc<Self>, attempts: &mut u32) -> Result<()> {
        *attempts += 1;
        if *attempts > MAX_OPERATION_RETRIES {
            debug_assert!(false, "an operation retried too many times");
            let err = JaalError::CacheConsistency(
                "an operation retried too many times without progress".to_string(),
            );
            self.report_failure(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Marks the node failed, wakes every entry waiter so blocked
    /// operations can observe the failure, and notifies the watchdog.
    pub(crate) fn report_failure(self: &Arc<Self>, err: &JaalError) {
        warn!(error = %err, "caching data store failed");
        let first = !self.failed.swap(true, Ordering::SeqCst);
        self.cache.notify_all_stripes();
        if !first {
            return;
        }
        let watchdog = {
            let mut state = self.watchdog.lock();
            match state.watchdog.clone() {
                Some(watchdog) => Some(watchdog),
                None => {
                    state.failure_before = Some(err.to_string());
                    None
                }
            }
        };
        if let Some(watchdog) = watchdog {
            let node_id = self.node_id;
            let result = thread::Builder::new()
                .name("jaaldb-report-failure".to_string())
                .spawn(move || watchdog.report_failure(node_id, "jaaldb-store"));
            if result.is_err() {
                warn!("could not spawn the failure report thread");
            }
        }
    }

    pub(crate) fn shutdown_txns_completed(&self) -> bool {
        self.shutdown_gate.txns_completed()
    }

    fn maybe_check_bindings(self: &Arc<Self>, level: CheckLevel) {
        if self.config.check_bindings.should_check(level) {
            if let Err(err) = self.cache.check_bindings() {
                self.report_failure(&err);
            }
        }
    }

    // -- In-use tests --------------------------------------------------------

    fn object_in_use(&self, entry: &ObjectEntry) -> bool {
        entry.core.context_id() > self.queue.highest_settled_context_id()
    }

    fn object_in_use_for_write(&self, entry: &ObjectEntry) -> bool {
        entry.core.modified() && self.object_in_use(entry)
    }

    fn binding_in_use(&self, entry: &BindingEntry) -> bool {
        entry.pending_previous()
            || entry.core.context_id() > self.queue.highest_settled_context_id()
    }

    fn binding_in_use_for_write(&self, entry: &BindingEntry) -> bool {
        entry.core.modified() && self.binding_in_use(entry)
    }

    pub(crate) fn entry_in_use(&self, entry: &AnyEntry) -> bool {
        match entry {
            AnyEntry::Object(e) => self.object_in_use(e),
            AnyEntry::Binding(e) => self.binding_in_use(e),
        }
    }

    // -- Eviction entry points -----------------------------------------------

    pub(crate) fn evict_entry_now(self: &Arc<Self>, entry: &AnyEntry, stripe: &Stripe) {
        match entry {
            AnyEntry::Object(e) => self.evict_object_now(e, stripe),
            AnyEntry::Binding(e) => self.evict_binding_now(e, stripe),
        }
    }

    pub(crate) fn schedule_evict_task_for(self: &Arc<Self>, entry: &AnyEntry) {
        match entry {
            AnyEntry::Object(e) => self.schedule_task(StoreTask::EvictObject(e.oid)),
            AnyEntry::Binding(e) => self.schedule_task(StoreTask::EvictBinding(e.key.clone())),
        }
    }

    fn evict_object_now(self: &Arc<Self>, entry: &Arc<ObjectEntry>, stripe: &Stripe) {
        entry.core.set_evicting(stripe);
        self.pending_evictions.fetch_add(1, Ordering::SeqCst);
        let store = Arc::clone(self);
        let oid = entry.oid;
        self.queue.evict_object(
            oid,
            Box::new(move |result| {
                match result {
                    Ok(()) => {
                        let stripe = store.cache.object_stripe(oid);
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_object_entry(oid) {
                            entry.core.set_evicted(stripe);
                            store.cache.remove_object_entry(oid);
                        }
                    }
                    Err(JaalError::Shutdown) => {}
                    Err(err) => store.report_failure(&err),
                }
                store.pending_evictions.fetch_sub(1, Ordering::SeqCst);
            }),
        );
    }

    fn evict_binding_now(self: &Arc<Self>, entry: &Arc<BindingEntry>, stripe: &Stripe) {
        entry.core.set_evicting(stripe);
        self.pending_evictions.fetch_add(1, Ordering::SeqCst);
        let store = Arc::clone(self);
        let key = entry.key.clone();
        self.queue.evict_binding(
            key.clone(),
            Box::new(move |result| {
                match result {
                    Ok(()) => {
                        let stripe = store.cache.binding_stripe(&key);
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&key) {
                            entry.core.set_evicted(stripe);
                            store.cache.remove_binding_entry(&key);
                        }
                    }
                    Err(JaalError::Shutdown) => {}
                    Err(err) => store.report_failure(&err),
                }
                store.pending_evictions.fetch_sub(1, Ordering::SeqCst);
            }),
        );
    }

    // -- Deferred tasks ------------------------------------------------------

    fn schedule_task(self: &Arc<Self>, task: StoreTask) {
        let store = Arc::clone(self);
        if !self.task_pool.execute(move || store.run_task(task)) {
            trace!("task dropped after shutdown");
        }
    }

    fn run_task(self: &Arc<Self>, task: StoreTask) {
        let done = match &task {
            StoreTask::EvictObject(oid) => self.try_evict_object_task(*oid),
            StoreTask::DowngradeObject(oid) => self.try_downgrade_object_task(*oid),
            StoreTask::EvictBinding(key) => self.try_evict_binding_task(key.clone()),
            StoreTask::DowngradeBinding(key) => self.try_downgrade_binding_task(key.clone()),
        };
        if !done && !self.shutdown_txns_completed() && !self.failed.load(Ordering::SeqCst) {
            // The entry is still busy; try again once its users move on.
            thread::sleep(self.config.retry_wait);
            self.schedule_task(task);
        }
    }

    fn try_evict_object_task(self: &Arc<Self>, oid: ObjectId) -> bool {
        self.access.report_object_access(oid, AccessKind::Write);
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        let Some(entry) = self.cache.get_object_entry(oid) else {
            return true;
        };
        if entry.core.decaching() || entry.core.decached() {
            return true;
        }
        if entry.core.reading()
            || entry.core.upgrading()
            || entry.core.downgrading()
            || self.object_in_use(&entry)
        {
            return false;
        }
        self.evict_object_now(&entry, stripe);
        true
    }

    fn try_downgrade_object_task(self: &Arc<Self>, oid: ObjectId) -> bool {
        self.access.report_object_access(oid, AccessKind::Read);
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        let Some(entry) = self.cache.get_object_entry(oid) else {
            return true;
        };
        if entry.core.upgrading() {
            return false;
        }
        if !entry.core.writable() {
            // Already read-only, or an evict or downgrade is in flight.
            return true;
        }
        if self.object_in_use_for_write(&entry) {
            return false;
        }
        entry.core.set_evicting_downgrade(stripe);
        let store = Arc::clone(self);
        self.queue.downgrade_object(
            oid,
            Box::new(move |result| match result {
                Ok(()) => {
                    let stripe = store.cache.object_stripe(oid);
                    let _guard = stripe.lock();
                    if let Some(entry) = store.cache.get_object_entry(oid) {
                        if entry.core.downgrading() {
                            entry.core.set_evicted_downgrade(stripe);
                        }
                    }
                }
                Err(JaalError::Shutdown) => {}
                Err(err) => store.report_failure(&err),
            }),
        );
        true
    }

    fn try_evict_binding_task(self: &Arc<Self>, name_key: BindingKey) -> bool {
        self.access.report_name_access(&name_key, AccessKind::Write);
        let stop = Instant::now() + self.config.lock_timeout;
        let mut attempts = 0u32;
        loop {
            if self.retry_guard(&mut attempts).is_err() {
                return false;
            }
            let Some(entry) = self.cache.ceiling_binding_entry(&name_key) else {
                return true;
            };
            let stripe = self.cache.binding_stripe(&entry.key);
            let mut guard = stripe.lock();
            if name_key == entry.key {
                if entry
                    .await_not_pending_previous(stripe, &mut guard, stop)
                    .is_err()
                {
                    return false;
                }
                if entry.core.decaching() || entry.core.decached() {
                    return true;
                }
            } else {
                match self.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => return false,
                }
                if !entry.is_next_entry(&name_key) {
                    // The certificate no longer covers the name, so the
                    // name is already out of the cache.
                    return true;
                }
            }
            if entry.core.reading()
                || entry.core.upgrading()
                || entry.core.downgrading()
                || self.binding_in_use(&entry)
            {
                return false;
            }
            if entry.core.decaching() || entry.core.decached() {
                return true;
            }
            if name_key == entry.key {
                self.evict_binding_now(&entry, stripe);
            } else {
                // Evicting an unbound name: the server forgets it and the
                // covering certificate shrinks once acknowledged.
                entry.set_pending_previous();
                let store = Arc::clone(self);
                let entry_key = entry.key.clone();
                let evicted = name_key.clone();
                self.queue.evict_binding(
                    name_key.clone(),
                    Box::new(move |result| match result {
                        Ok(()) => {
                            let stripe = store.cache.binding_stripe(&entry_key);
                            let _guard = stripe.lock();
                            if let Some(entry) = store.cache.get_binding_entry(&entry_key) {
                                entry.set_previous_key(Some(evicted.clone()), false);
                                entry.set_not_pending_previous(stripe);
                            }
                        }
                        Err(JaalError::Shutdown) => {}
                        Err(err) => store.report_failure(&err),
                    }),
                );
            }
            return true;
        }
    }

    fn try_downgrade_binding_task(self: &Arc<Self>, name_key: BindingKey) -> bool {
        self.access.report_name_access(&name_key, AccessKind::Read);
        let stop = Instant::now() + self.config.lock_timeout;
        let mut attempts = 0u32;
        loop {
            if self.retry_guard(&mut attempts).is_err() {
                return false;
            }
            let Some(entry) = self.cache.ceiling_binding_entry(&name_key) else {
                return true;
            };
            let stripe = self.cache.binding_stripe(&entry.key);
            let mut guard = stripe.lock();
            if name_key == entry.key {
                if entry
                    .await_not_pending_previous(stripe, &mut guard, stop)
                    .is_err()
                {
                    return false;
                }
            } else {
                match self.assure_next_entry(&entry, &name_key, stripe, &mut guard, stop) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => return false,
                }
                if !entry.is_next_entry(&name_key) {
                    return true;
                }
            }
            if entry.core.decaching() || entry.core.decached() || entry.core.downgrading() {
                return true;
            }
            if entry.core.upgrading() || self.binding_in_use_for_write(&entry) {
                return false;
            }
            if !entry.core.writable() {
                return true;
            }
            entry.core.set_evicting_downgrade(stripe);
            let store = Arc::clone(self);
            let entry_key = entry.key.clone();
            self.queue.downgrade_binding(
                entry_key.clone(),
                Box::new(move |result| match result {
                    Ok(()) => {
                        let stripe = store.cache.binding_stripe(&entry_key);
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&entry_key) {
                            if entry.core.downgrading() {
                                entry.core.set_evicted_downgrade(stripe);
                            }
                        }
                    }
                    Err(JaalError::Shutdown) => {}
                    Err(err) => store.report_failure(&err),
                }),
            );
            if name_key != entry.key {
                // The server asked about the covered unbound name; tell it
                // that name's write access is gone as well.
                let store = Arc::clone(self);
                self.queue.downgrade_binding(
                    name_key.clone(),
                    Box::new(move |result| {
                        if let Err(err) = result {
                            if !matches!(err, JaalError::Shutdown) {
                                store.report_failure(&err);
                            }
                        }
                    }),
                );
            }
            return true;
        }
    }

    // -- Callback entry points -----------------------------------------------

    fn evict_object_request(self: &Arc<Self>, oid: ObjectId) -> bool {
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        let Some(entry) = self.cache.get_object_entry(oid) else {
            return true;
        };
        if entry.core.decaching() {
            // Already on its way out; the server hears through the queue.
            return false;
        }
        if entry.core.decached() {
            return true;
        }
        if !entry.core.reading()
            && !entry.core.upgrading()
            && !entry.core.downgrading()
            && !self.object_in_use(&entry)
        {
            entry.core.set_evicted_immediate(stripe);
            self.cache.remove_object_entry(oid);
            return true;
        }
        self.schedule_task(StoreTask::EvictObject(oid));
        false
    }

    fn downgrade_object_request(self: &Arc<Self>, oid: ObjectId) -> bool {
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        let Some(entry) = self.cache.get_object_entry(oid) else {
            return true;
        };
        if entry.core.downgrading() {
            return false;
        }
        if entry.core.upgrading() {
            self.schedule_task(StoreTask::DowngradeObject(oid));
            return false;
        }
        if !entry.core.writable() {
            return true;
        }
        if !self.object_in_use_for_write(&entry) {
            entry.core.set_evicted_downgrade_immediate(stripe);
            return true;
        }
        self.schedule_task(StoreTask::DowngradeObject(oid));
        false
    }

    fn evict_binding_request(self: &Arc<Self>, name_key: BindingKey) -> bool {
        let mut attempts = 0u32;
        loop {
            if self.retry_guard(&mut attempts).is_err() {
                return false;
            }
            let Some(entry) = self.cache.ceiling_binding_entry(&name_key) else {
                return true;
            };
            let stripe = self.cache.binding_stripe(&entry.key);
            let _guard = stripe.lock();
            if name_key != entry.key {
                match self.cache.higher_binding_entry(&name_key) {
                    Some(check) if Arc::ptr_eq(&check, &entry) => {}
                    _ => continue,
                }
                if !entry.is_next_entry(&name_key) {
                    return true;
                }
            }
            if entry.pending_previous()
                || entry.core.reading()
                || entry.core.upgrading()
                || entry.core.downgrading()
                || self.binding_in_use(&entry)
            {
                self.schedule_task(StoreTask::EvictBinding(name_key.clone()));
                return false;
            }
            if entry.core.decaching() {
                return false;
            }
            if entry.core.decached() {
                return true;
            }
            if name_key == entry.key {
                entry.core.set_evicted_immediate(stripe);
                self.cache.remove_binding_entry(&name_key);
                return true;
            }
            // An unbound name inside the certificate: shrink it so the
            // name is no longer covered.
            debug_assert!(entry.previous_key().map_or(false, |p| p < name_key));
            entry.set_previous_key(Some(name_key.clone()), false);
            return true;
        }
    }

    fn downgrade_binding_request(self: &Arc<Self>, name_key: BindingKey) -> bool {
        let mut attempts = 0u32;
        loop {
            if self.retry_guard(&mut attempts).is_err() {
                return false;
            }
            let Some(entry) = self.cache.ceiling_binding_entry(&name_key) else {
                return true;
            };
            let stripe = self.cache.binding_stripe(&entry.key);
            let _guard = stripe.lock();
            if name_key != entry.key {
                match self.cache.higher_binding_entry(&name_key) {
                    Some(check) if Arc::ptr_eq(&check, &entry) => {}
                    _ => continue,
                }
                if !entry.is_next_entry(&name_key) {
                    return true;
                }
            }
            if entry.pending_previous()
                || entry.core.upgrading()
                || self.binding_in_use_for_write(&entry)
            {
                self.schedule_task(StoreTask::DowngradeBinding(name_key.clone()));
                return false;
            }
            if entry.core.decaching() || entry.core.downgrading() {
                return false;
            }
            if !entry.core.writable() {
                return true;
            }
            entry.core.set_evicted_downgrade_immediate(stripe);
            if name_key != entry.key {
                // The next bound name's write access went away with the
                // covered name's; the server is told through the queue.
                let store = Arc::clone(self);
                self.queue.downgrade_binding(
                    entry.key.clone(),
                    Box::new(move |result| {
                        if let Err(err) = result {
                            if !matches!(err, JaalError::Shutdown) {
                                store.report_failure(&err);
                            }
                        }
                    }),
                );
            }
            return true;
        }
    }

    // -- Object fetches ------------------------------------------------------

    fn spawn_object_id_fetch(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let submitted = self.fetch_pool.execute(move || {
            let count = store.oid_cache.batch_size();
            match run_io(&store.retry, || {
                store.server.new_object_ids(store.node_id, count)
            }) {
                Ok(range) => store.oid_cache.install(range),
                Err(err) => {
                    store.oid_cache.fetch_failed();
                    store.report_failure(&err);
                }
            }
        });
        if !submitted {
            self.oid_cache.fetch_failed();
        }
    }

    fn spawn_object_fetch(
        self: &Arc<Self>,
        context: Arc<TxnContext>,
        oid: ObjectId,
        for_update: bool,
    ) {
        let store = Arc::clone(self);
        let submitted = self.fetch_pool.execute(move || {
            let result = run_io(&store.retry, || {
                if for_update {
                    store
                        .server
                        .get_object_for_update(store.node_id, oid)
                        .map(|r| (r.data, r.callback_evict, r.callback_downgrade))
                } else {
                    store
                        .server
                        .get_object(store.node_id, oid)
                        .map(|r| (r.data, r.callback_evict, false))
                }
            });
            let stripe = store.cache.object_stripe(oid);
            match result {
                Ok((data, callback_evict, callback_downgrade)) => {
                    {
                        let _guard = stripe.lock();
                        match store.cache.get_object_entry(oid) {
                            Some(entry) => {
                                context.note_cached_object(&entry, stripe, data, for_update);
                            }
                            None => store.report_failure(&JaalError::CacheConsistency(
                                format!("fetched object {} has no cache entry", oid),
                            )),
                        }
                    }
                    if callback_evict {
                        store.schedule_task(StoreTask::EvictObject(oid));
                    }
                    if callback_downgrade {
                        store.schedule_task(StoreTask::DowngradeObject(oid));
                    }
                }
                Err(err) => {
                    store.abandon_object_fetch(oid);
                    store.report_failure(&err);
                }
            }
        });
        if !submitted {
            self.abandon_object_fetch(oid);
        }
    }

    /// Unwinds a fetch that will not complete so waiters see a decached
    /// entry instead of hanging.
    fn abandon_object_fetch(&self, oid: ObjectId) {
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        if let Some(entry) = self.cache.get_object_entry(oid) {
            if entry.core.reading() {
                entry.core.set_evicted_abandon_fetching(stripe);
                self.cache.remove_object_entry(oid);
            }
        }
    }

    fn spawn_object_upgrade(self: &Arc<Self>, context: Arc<TxnContext>, oid: ObjectId) {
        let store = Arc::clone(self);
        let submitted = self.fetch_pool.execute(move || {
            let result = run_io(&store.retry, || store.server.upgrade_object(store.node_id, oid));
            let stripe = store.cache.object_stripe(oid);
            match result {
                Ok(results) => {
                    {
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_object_entry(oid) {
                            context.note_object_access(&entry);
                            if !entry.core.writable() {
                                entry.core.set_upgraded(stripe);
                            }
                        }
                    }
                    if results.callback_evict {
                        store.schedule_task(StoreTask::EvictObject(oid));
                    }
                }
                Err(err) => {
                    store.abandon_object_upgrade(oid);
                    store.report_failure(&err);
                }
            }
        });
        if !submitted {
            self.abandon_object_upgrade(oid);
        }
    }

    fn abandon_object_upgrade(&self, oid: ObjectId) {
        let stripe = self.cache.object_stripe(oid);
        let _guard = stripe.lock();
        if let Some(entry) = self.cache.get_object_entry(oid) {
            if entry.core.upgrading() {
                entry.core.set_upgrade_abandoned(stripe);
            }
        }
    }

    /// The shared write-path loop: look the object up, fetch or upgrade as
    /// needed, and run `apply` once the entry is writable.
    fn with_writable_object(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        oid: ObjectId,
        apply: impl FnOnce(&Arc<ObjectEntry>) -> Result<()>,
    ) -> Result<()> {
        let stop = context.stop_time;
        let mut attempts = 0u32;
        let mut reservation: Option<CacheReservation> = None;
        let mut apply = Some(apply);
        let stripe = self.cache.object_stripe(oid);
        let mut guard = stripe.lock();
        loop {
            self.retry_guard(&mut attempts)?;
            self.check_failed()?;
            let entry = match self.cache.get_object_entry(oid) {
                Some(entry) => entry,
                None => match reservation.as_mut().filter(|res| res.unused() > 0) {
                    Some(res) => {
                        let entry = context.note_fetching_object(&self.cache, oid, res);
                        self.spawn_object_fetch(Arc::clone(context), oid, true);
                        entry
                    }
                    None => {
                        drop(guard);
                        reservation = Some(self.cache.reserve(1));
                        guard = stripe.lock();
                        continue;
                    }
                },
            };
            match entry.core.await_writable(stripe, &mut guard, stop)? {
                AwaitWritable::Decached => continue,
                AwaitWritable::Readable => {
                    entry.core.set_fetching_upgrade(stripe);
                    self.spawn_object_upgrade(Arc::clone(context), oid);
                    match entry.core.await_writable(stripe, &mut guard, stop)? {
                        AwaitWritable::Writable => {}
                        _ => continue,
                    }
                }
                AwaitWritable::Writable => {}
            }
            let result = match apply.take() {
                Some(apply) => apply(&entry),
                None => Err(JaalError::IllegalState(
                    "write closure already consumed".to_string(),
                )),
            };
            drop(guard);
            drop(reservation);
            return result;
        }
    }

    // -- Binding fetches -----------------------------------------------------

    /// Marks the next entry pending previous, hands the server call to the
    /// fetch pool, and waits for the completion to release the claim.
    fn call_server_for_binding(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        next_entry: &Arc<BindingEntry>,
        name_key: &BindingKey,
        call: BindingCall,
    ) -> Result<()> {
        next_entry.set_pending_previous();
        self.spawn_binding_fetch(
            Arc::clone(context),
            name_key.clone(),
            next_entry.key.clone(),
            call,
        );
        next_entry.await_not_pending_previous(stripe, guard, context.stop_time)
    }

    fn spawn_binding_fetch(
        self: &Arc<Self>,
        context: Arc<TxnContext>,
        name_key: BindingKey,
        cached_next_key: BindingKey,
        call: BindingCall,
    ) {
        let store = Arc::clone(self);
        let next_key = cached_next_key.clone();
        let submitted = self.fetch_pool.execute(move || {
            store.run_binding_fetch(context, name_key, cached_next_key, call)
        });
        if !submitted {
            self.abandon_binding_fetch(&next_key);
        }
    }

    /// Unwinds a binding fetch that will not complete: collapse a
    /// provisional last entry and release the pending-previous claim.
    fn abandon_binding_fetch(&self, cached_next_key: &BindingKey) {
        let stripe = self.cache.binding_stripe(cached_next_key);
        let _guard = stripe.lock();
        if let Some(entry) = self.cache.get_binding_entry(cached_next_key) {
            if entry.core.reading() {
                entry.core.set_evicted_abandon_fetching(stripe);
                self.cache.remove_binding_entry(cached_next_key);
            }
            if entry.pending_previous() {
                entry.set_not_pending_previous(stripe);
            }
        }
    }

    /// Capacity for a fetch completion, polled so shutdown and failure can
    /// interrupt the wait.
    fn reserve_for_fetch(&self, count: usize) -> Option<CacheReservation> {
        loop {
            if let Some(reservation) = self.cache.try_reserve(count) {
                return Some(reservation);
            }
            if self.shutdown_txns_completed() || self.failed.load(Ordering::SeqCst) {
                return None;
            }
            thread::sleep(self.config.retry_wait);
        }
    }

    fn run_binding_fetch(
        self: &Arc<Self>,
        context: Arc<TxnContext>,
        name_key: BindingKey,
        cached_next_key: BindingKey,
        call: BindingCall,
    ) {
        let reserve_count = if call == BindingCall::Remove { 2 } else { 1 };
        let Some(mut reservation) = self.reserve_for_fetch(reserve_count) else {
            self.abandon_binding_fetch(&cached_next_key);
            return;
        };
        let name = name_key.name().map(str::to_string);
        let result = run_io(&self.retry, || {
            self.call_binding_server(&name, call)
        });
        match result {
            Ok(fetch) => {
                let server_next = fetch.server_next_key.clone();
                self.handle_binding_results(
                    &context,
                    &name_key,
                    &cached_next_key,
                    &fetch,
                    &mut reservation,
                );
                let primary_key = match call {
                    BindingCall::Remove => Some(name_key.clone()),
                    BindingCall::NextName => server_next.clone(),
                    BindingCall::Read | BindingCall::Update => {
                        if fetch.name_state == BindingState::Bound {
                            Some(name_key.clone())
                        } else {
                            server_next.clone()
                        }
                    }
                };
                if fetch.callback_evict {
                    if let Some(key) = primary_key.clone() {
                        self.schedule_task(StoreTask::EvictBinding(key));
                    }
                }
                if fetch.callback_downgrade {
                    if let Some(key) = primary_key {
                        self.schedule_task(StoreTask::DowngradeBinding(key));
                    }
                }
                if fetch.next_callback_evict {
                    if let Some(key) = server_next.clone() {
                        self.schedule_task(StoreTask::EvictBinding(key));
                    }
                }
                if fetch.next_callback_downgrade {
                    if let Some(key) = server_next {
                        self.schedule_task(StoreTask::DowngradeBinding(key));
                    }
                }
            }
            Err(err) => {
                self.abandon_binding_fetch(&cached_next_key);
                self.report_failure(&err);
            }
        }
    }

    /// One server call, normalized into a [`BindingFetch`].
    fn call_binding_server(&self, name: &Option<String>, call: BindingCall) -> Result<BindingFetch> {
        match call {
            BindingCall::Read => {
                let name = name.as_deref().unwrap_or_default();
                let results = self.server.get_binding(self.node_id, name)?;
                Ok(BindingFetch {
                    name_state: if results.found {
                        BindingState::Bound
                    } else {
                        BindingState::Unbound
                    },
                    name_oid: if results.found { results.oid } else { None },
                    name_for_write: false,
                    server_next_key: if results.found {
                        None
                    } else {
                        Some(results.next_name.unwrap_or(BindingKey::Last))
                    },
                    server_next_oid: if results.found { None } else { results.oid },
                    next_for_write: false,
                    callback_evict: results.callback_evict,
                    callback_downgrade: false,
                    next_callback_evict: false,
                    next_callback_downgrade: false,
                })
            }
            BindingCall::Update => {
                let name = name.as_deref().unwrap_or_default();
                let results = self.server.get_binding_for_update(self.node_id, name)?;
                Ok(BindingFetch {
                    name_state: if results.found {
                        BindingState::Bound
                    } else {
                        BindingState::Unbound
                    },
                    name_oid: if results.found { results.oid } else { None },
                    name_for_write: true,
                    server_next_key: if results.found {
                        None
                    } else {
                        Some(results.next_name.unwrap_or(BindingKey::Last))
                    },
                    server_next_oid: if results.found { None } else { results.oid },
                    next_for_write: true,
                    callback_evict: results.callback_evict,
                    callback_downgrade: results.callback_downgrade,
                    next_callback_evict: false,
                    next_callback_downgrade: false,
                })
            }
            BindingCall::Remove => {
                let name = name.as_deref().unwrap_or_default();
                let results = self.server.get_binding_for_remove(self.node_id, name)?;
                Ok(BindingFetch {
                    name_state: if results.found {
                        BindingState::Bound
                    } else {
                        BindingState::Unbound
                    },
                    name_oid: results.oid,
                    name_for_write: true,
                    server_next_key: Some(results.next_name),
                    server_next_oid: results.next_oid,
                    next_for_write: results.found,
                    callback_evict: results.callback_evict,
                    callback_downgrade: results.callback_downgrade,
                    next_callback_evict: results.next_callback_evict,
                    next_callback_downgrade: results.next_callback_downgrade,
                })
            }
            BindingCall::NextName => {
                let results = self
                    .server
                    .next_bound_name(self.node_id, name.as_deref())?;
                Ok(BindingFetch {
                    name_state: BindingState::Unknown,
                    name_oid: None,
                    name_for_write: false,
                    server_next_key: Some(results.next_name),
                    server_next_oid: results.oid,
                    next_for_write: false,
                    callback_evict: results.callback_evict,
                    callback_downgrade: false,
                    next_callback_evict: false,
                    next_callback_downgrade: false,
                })
            }
        }
    }

    /// Applies a binding fetch to the cache: install or upgrade the entry
    /// for the requested name, insert the server's next entry when it is
    /// lower than the cached one, and update the cached next entry's
    /// certificate before releasing its pending-previous claim.
    fn handle_binding_results(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        name_key: &BindingKey,
        cached_next_key: &BindingKey,
        fetch: &BindingFetch,
        reservation: &mut CacheReservation,
    ) {
        if fetch.name_state == BindingState::Bound {
            let stripe = self.cache.binding_stripe(name_key);
            let _guard = stripe.lock();
            match self.cache.get_binding_entry(name_key) {
                None => {
                    context.note_cached_binding(
                        &self.cache,
                        name_key.clone(),
                        fetch.name_oid,
                        fetch.name_for_write,
                        reservation,
                    );
                }
                Some(entry) => {
                    debug_assert!(!entry.pending_previous());
                    context.note_binding_access(&entry);
                    if fetch.name_for_write && !entry.core.writable() {
                        entry.core.set_upgraded(stripe);
                    }
                }
            }
        }

        if let Some(server_next) = &fetch.server_next_key {
            if server_next < cached_next_key {
                let stripe = self.cache.binding_stripe(server_next);
                let _guard = stripe.lock();
                if self.cache.get_binding_entry(server_next).is_none() {
                    let entry = context.note_cached_binding(
                        &self.cache,
                        server_next.clone(),
                        fetch.server_next_oid,
                        fetch.next_for_write,
                        reservation,
                    );
                    entry.update_previous_key(name_key, fetch.name_state);
                }
            }
        }

        let stripe = self.cache.binding_stripe(cached_next_key);
        let _guard = stripe.lock();
        let Some(entry) = self.cache.get_binding_entry(cached_next_key) else {
            debug_assert!(false, "cached next entry vanished while pending previous");
            return;
        };
        let covers = fetch
            .server_next_key
            .as_ref()
            .map_or(false, |key| key >= cached_next_key);
        if covers {
            let updated = entry.update_previous_key(name_key, fetch.name_state);
            debug_assert!(updated);
            context.note_binding_access(&entry);
            if entry.core.reading() {
                // The provisional last entry is real: nothing lies between
                // the requested name and the end of the namespace.
                entry.core.set_cached_read(stripe);
            }
            if fetch.next_for_write && !entry.core.writable() && !entry.core.reading() {
                entry.core.set_upgraded(stripe);
            }
        } else if entry.core.reading() {
            // The provisional last entry was not needed after all.
            entry.core.set_evicted_abandon_fetching(stripe);
            self.cache.remove_binding_entry(cached_next_key);
        }
        entry.set_not_pending_previous(stripe);
    }

    /// Revalidates that `entry` is still the next cached entry after
    /// `previous_key`: not claimed by another operation, not mid-upgrade,
    /// and still present in the index. `false` means retry from lookup.
    fn assure_next_entry(
        &self,
        entry: &Arc<BindingEntry>,
        previous_key: &BindingKey,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        stop: Instant,
    ) -> Result<bool> {
        debug_assert!(stripe.mutex.is_locked());
        if entry.core.upgrading() {
            entry.core.await_not_upgrading(stripe, guard, stop)?;
        }
        entry.await_not_pending_previous(stripe, guard, stop)?;
        match self.cache.higher_binding_entry(previous_key) {
            Some(check) if Arc::ptr_eq(&check, entry) => {}
            _ => return Ok(false),
        }
        if entry.core.upgrading() {
            return Ok(false);
        }
        Ok(entry.core.readable() || entry.core.reading())
    }

    // -- set_binding helpers -------------------------------------------------

    /// The name's own entry exists; make it writable. `false` means retry.
    fn set_binding_found(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        entry: &Arc<BindingEntry>,
    ) -> Result<bool> {
        let stop = context.stop_time;
        match entry.core.await_writable(stripe, guard, stop)? {
            AwaitWritable::Decached => Ok(false),
            AwaitWritable::Readable => {
                entry.await_not_pending_previous(stripe, guard, stop)?;
                if entry.core.writable() {
                    return Ok(true);
                }
                if entry.core.upgrading() {
                    entry.core.await_not_upgrading(stripe, guard, stop)?;
                    return Ok(entry.core.writable());
                }
                if entry.core.state() != EntryState::Readable {
                    return Ok(false);
                }
                entry.core.set_fetching_upgrade(stripe);
                self.spawn_binding_upgrade(Arc::clone(context), entry.key.clone());
                entry.core.await_not_upgrading(stripe, guard, stop)?;
                Ok(entry.core.writable())
            }
            AwaitWritable::Writable => Ok(true),
        }
    }

    /// The next entry certifies the name unbound; make the next entry
    /// writable while keeping the certificate. `false` means retry.
    fn set_binding_unbound(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        entry: &Arc<BindingEntry>,
        name_key: &BindingKey,
    ) -> Result<bool> {
        let stop = context.stop_time;
        match entry.core.await_writable(stripe, guard, stop)? {
            AwaitWritable::Decached => Ok(false),
            AwaitWritable::Readable => {
                entry.await_not_pending_previous(stripe, guard, stop)?;
                if !entry.known_unbound(name_key) {
                    return Ok(false);
                }
                if !entry.core.writable() {
                    if entry.core.state() != EntryState::Readable || entry.pending_previous() {
                        return Ok(false);
                    }
                    entry.set_pending_previous();
                    self.spawn_binding_upgrade_next(name_key.clone(), entry.key.clone());
                    entry.await_not_pending_previous(stripe, guard, stop)?;
                }
                Ok(entry.core.writable() && entry.known_unbound(name_key))
            }
            AwaitWritable::Writable => Ok(true),
        }
    }

    /// Upgrades the entry for a name the server knows is bound.
    fn spawn_binding_upgrade(self: &Arc<Self>, context: Arc<TxnContext>, name_key: BindingKey) {
        let store = Arc::clone(self);
        let abandon_key = name_key.clone();
        let submitted = self.fetch_pool.execute(move || {
            let name = name_key.name().unwrap_or_default().to_string();
            let result = run_io(&store.retry, || {
                store.server.get_binding_for_update(store.node_id, &name)
            });
            let stripe = store.cache.binding_stripe(&name_key);
            match result {
                Ok(results) => {
                    debug_assert!(results.found);
                    {
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&name_key) {
                            context.note_binding_access(&entry);
                            if !entry.core.writable() {
                                entry.core.set_upgraded(stripe);
                            }
                        }
                    }
                    if results.callback_evict {
                        store.schedule_task(StoreTask::EvictBinding(name_key.clone()));
                    }
                    if results.callback_downgrade {
                        store.schedule_task(StoreTask::DowngradeBinding(name_key.clone()));
                    }
                }
                Err(err) => {
                    {
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&name_key) {
                            if entry.core.upgrading() {
                                entry.core.set_upgrade_abandoned(stripe);
                            }
                        }
                    }
                    store.report_failure(&err);
                }
            }
        });
        if !submitted {
            let stripe = self.cache.binding_stripe(&abandon_key);
            let _guard = stripe.lock();
            if let Some(entry) = self.cache.get_binding_entry(&abandon_key) {
                if entry.core.upgrading() {
                    entry.core.set_upgrade_abandoned(stripe);
                }
            }
        }
    }

    /// Upgrades the next entry covering a name the server knows is
    /// unbound. The next entry holds the pending-previous claim.
    fn spawn_binding_upgrade_next(
        self: &Arc<Self>,
        name_key: BindingKey,
        next_key: BindingKey,
    ) {
        let store = Arc::clone(self);
        let abandon_key = next_key.clone();
        let submitted = self.fetch_pool.execute(move || {
            let name = name_key.name().unwrap_or_default().to_string();
            let result = run_io(&store.retry, || {
                store.server.get_binding_for_update(store.node_id, &name)
            });
            let stripe = store.cache.binding_stripe(&next_key);
            match result {
                Ok(results) => {
                    debug_assert!(!results.found);
                    {
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&next_key) {
                            if !entry.core.writable() && !entry.core.reading() {
                                entry.core.set_upgraded(stripe);
                            }
                            entry.set_not_pending_previous(stripe);
                        }
                    }
                    if results.callback_evict {
                        store.schedule_task(StoreTask::EvictBinding(next_key.clone()));
                    }
                    if results.callback_downgrade {
                        store.schedule_task(StoreTask::DowngradeBinding(next_key.clone()));
                    }
                }
                Err(err) => {
                    {
                        let _guard = stripe.lock();
                        if let Some(entry) = store.cache.get_binding_entry(&next_key) {
                            if entry.pending_previous() {
                                entry.set_not_pending_previous(stripe);
                            }
                        }
                    }
                    store.report_failure(&err);
                }
            }
        });
        if !submitted {
            self.abandon_binding_fetch(&abandon_key);
        }
    }

    // -- remove_binding helpers ----------------------------------------------

    /// The name's own entry exists; decide whether it is usable for the
    /// remove. On a readable entry the upgrade is left to the remove
    /// fetch, which covers both the name and its successor.
    fn remove_binding_found(
        &self,
        stripe: &Stripe,
        guard: &mut MutexGuard<'_, ()>,
        entry: &Arc<BindingEntry>,
        stop: Instant,
    ) -> Result<bool> {
        match entry.core.await_writable(stripe, guard, stop)? {
            AwaitWritable::Decached => Ok(false),
            AwaitWritable::Readable => {
                entry.await_not_pending_previous(stripe, guard, stop)?;
                if entry.core.writable() {
                    return Ok(true);
                }
                if entry.core.state() != EntryState::Readable {
                    return Ok(false);
                }
                entry.core.set_fetching_upgrade(stripe);
                Ok(true)
            }
            AwaitWritable::Writable => Ok(true),
        }
    }

    /// Second half of a remove: claim the successor, tombstone the target,
    /// and fold the target's certificate into the successor's.
    fn remove_binding_check_next(
        self: &Arc<Self>,
        context: &Arc<TxnContext>,
        name_key: &BindingKey,
        name_writable: bool,
        reservation: &mut CacheReservation,
    ) -> Result<Option<BindingValue>> {
        let stop = context.stop_time;
        let cached = self.cache.higher_binding_entry(name_key);
        let next_key = cached.as_ref().map_or(BindingKey::Last, |e| e.key.clone());
        let stripe = self.cache.binding_stripe(&next_key);
        {
            let mut guard = stripe.lock();
            match cached {
                None => {
                    if self.cache.get_binding_entry(&BindingKey::Last).is_some() {
                        return Ok(None);
                    }
                    let entry = context.note_last_binding(&self.cache, reservation);
                    self.call_server_for_binding(
                        context,
                        stripe,
                        &mut guard,
                        &entry,
                        name_key,
                        BindingCall::Remove,
                    )?;
                    return Ok(None);
                }
                Some(entry) => {
                    if name_writable && entry.is_next_entry(name_key) && entry.core.writable() {
                        entry.set_pending_previous();
                    } else if !self.assure_next_entry(&entry, name_key, stripe, &mut guard, stop)? {
                        return Ok(None);
                    } else {
                        self.call_server_for_binding(
                            context,
                            stripe,
                            &mut guard,
                            &entry,
                            name_key,
                            BindingCall::Remove,
                        )?;
                        return Ok(None);
                    }
                }
            }
        }

        // Tombstone the target, capturing its certificate.
        let target = {
            let name_stripe = self.cache.binding_stripe(name_key);
            let _name_guard = name_stripe.lock();
            match self.cache.get_binding_entry(name_key) {
                Some(entry) => {
                    let info = entry.previous_key_info();
                    context.note_modified_binding(&entry, None);
                    Some(info)
                }
                None => None,
            }
        };
        let Some((previous_key, previous_key_unbound)) = target else {
            // The target vanished; release the successor's claim and retry.
            let _guard = stripe.lock();
            if let Some(entry) = self.cache.get_binding_entry(&next_key) {
                if entry.pending_previous() {
                    entry.set_not_pending_previous(stripe);
                }
            }
            return Ok(None);
        };

        self.access.report_name_access(&next_key, AccessKind::Write);
        {
            let _guard = stripe.lock();
            match self.cache.get_binding_entry(&next_key) {
                Some(entry) => {
                    let value = entry.value();
                    context.note_modified_binding(&entry, value);
                    match &previous_key {
                        None => {
                            entry.update_previous_key(name_key, BindingState::Unbound);
                        }
                        Some(previous) => {
                            entry.update_previous_key(
                                previous,
                                if previous_key_unbound {
                                    BindingState::Unbound
                                } else {
                                    BindingState::Unknown
                                },
                            );
                        }
                    }
                    entry.set_not_pending_previous(stripe);
                }
                None => {
                    self.report_failure(&JaalError::CacheConsistency(format!(
                        "successor {} vanished while pending previous",
                        next_key
                    )));
                }
            }
        }
        Ok(Some(BindingValue::was_bound(next_key.name_allow_last())))
    }
}
