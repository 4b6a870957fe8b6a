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

//! End-to-end tests of the caching store against an in-memory server.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use jaaldb_core::{BindingKey, JaalError, Result, StoreConfig};
use jaaldb_net::{
    CallbackHandler, GetBindingForRemoveResults, GetBindingForUpdateResults, GetBindingResults,
    GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults, NextObjectResults,
    ObjectIdRange, RegisterNodeResult, StoreServer, UpdateItem, UpdateSender,
    UpgradeObjectResults,
};
use jaaldb_store::{CachingStore, TxnId};

// =============================================================================
// In-memory server
// =============================================================================

#[derive(Default)]
struct MockState {
    objects: HashMap<u64, Vec<u8>>,
    bindings: BTreeMap<String, u64>,
    next_oid: u64,
    calls: HashMap<&'static str, usize>,
}

struct MockServer {
    state: Mutex<MockState>,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_oid: 1,
                ..Default::default()
            }),
        })
    }

    fn bind(&self, name: &str, oid: u64) {
        self.state.lock().bindings.insert(name.to_string(), oid);
    }

    fn put_object(&self, oid: u64, data: Vec<u8>) {
        self.state.lock().objects.insert(oid, data);
    }

    fn has_binding(&self, name: &str) -> bool {
        self.state.lock().bindings.contains_key(name)
    }

    fn call_count(&self, op: &'static str) -> usize {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    fn count(state: &mut MockState, op: &'static str) {
        *state.calls.entry(op).or_insert(0) += 1;
    }

    /// The smallest bound name strictly above `name`, with its oid.
    fn next_bound(state: &MockState, name: &str) -> (BindingKey, Option<u64>) {
        match state
            .bindings
            .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
            .next()
        {
            Some((next, oid)) => (BindingKey::for_name(next.clone()), Some(*oid)),
            None => (BindingKey::Last, None),
        }
    }
}

impl StoreServer for MockServer {
    fn register_node(&self, _callback_port: u16) -> Result<RegisterNodeResult> {
        Ok(RegisterNodeResult {
            node_id: 1,
            update_queue_port: 0,
        })
    }

    fn new_object_ids(&self, _node_id: u64, count: u64) -> Result<ObjectIdRange> {
        let mut state = self.state.lock();
        Self::count(&mut state, "new_object_ids");
        let first = state.next_oid;
        state.next_oid += count;
        Ok(ObjectIdRange {
            first,
            last: first + count - 1,
        })
    }

    fn get_object(&self, _node_id: u64, oid: u64) -> Result<GetObjectResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_object");
        Ok(GetObjectResults {
            data: state.objects.get(&oid).cloned(),
            callback_evict: false,
        })
    }

    fn get_object_for_update(&self, _node_id: u64, oid: u64) -> Result<GetObjectForUpdateResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_object_for_update");
        Ok(GetObjectForUpdateResults {
            data: state.objects.get(&oid).cloned(),
            callback_evict: false,
            callback_downgrade: false,
        })
    }

    fn upgrade_object(&self, _node_id: u64, _oid: u64) -> Result<UpgradeObjectResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "upgrade_object");
        Ok(UpgradeObjectResults {
            callback_evict: false,
        })
    }

    fn get_binding(&self, _node_id: u64, name: &str) -> Result<GetBindingResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_binding");
        match state.bindings.get(name).copied() {
            Some(oid) => Ok(GetBindingResults {
                found: true,
                oid: Some(oid),
                next_name: None,
                callback_evict: false,
            }),
            None => {
                let (next_name, oid) = Self::next_bound(&state, name);
                Ok(GetBindingResults {
                    found: false,
                    oid,
                    next_name: Some(next_name),
                    callback_evict: false,
                })
            }
        }
    }

    fn get_binding_for_update(
        &self,
        _node_id: u64,
        name: &str,
    ) -> Result<GetBindingForUpdateResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_binding_for_update");
        match state.bindings.get(name).copied() {
            Some(oid) => Ok(GetBindingForUpdateResults {
                found: true,
                oid: Some(oid),
                next_name: None,
                callback_evict: false,
                callback_downgrade: false,
            }),
            None => {
                let (next_name, oid) = Self::next_bound(&state, name);
                Ok(GetBindingForUpdateResults {
                    found: false,
                    oid,
                    next_name: Some(next_name),
                    callback_evict: false,
                    callback_downgrade: false,
                })
            }
        }
    }

    fn get_binding_for_remove(
        &self,
        _node_id: u64,
        name: &str,
    ) -> Result<GetBindingForRemoveResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "get_binding_for_remove");
        let found = state.bindings.get(name).copied();
        let (next_name, next_oid) = Self::next_bound(&state, name);
        Ok(GetBindingForRemoveResults {
            found: found.is_some(),
            oid: found,
            next_name,
            next_oid,
            callback_evict: false,
            callback_downgrade: false,
            next_callback_evict: false,
            next_callback_downgrade: false,
        })
    }

    fn next_bound_name(&self, _node_id: u64, name: Option<&str>) -> Result<NextBoundNameResults> {
        let mut state = self.state.lock();
        Self::count(&mut state, "next_bound_name");
        let (next_name, oid) = Self::next_bound(&state, name.unwrap_or(""));
        Ok(NextBoundNameResults {
            next_name,
            oid,
            callback_evict: false,
        })
    }

    fn next_object_id(&self, _node_id: u64, oid: Option<u64>) -> Result<Option<NextObjectResults>> {
        let mut state = self.state.lock();
        Self::count(&mut state, "next_object_id");
        let next = state
            .objects
            .iter()
            .filter(|(candidate, _)| oid.map_or(true, |o| **candidate > o))
            .min_by_key(|(candidate, _)| **candidate)
            .map(|(oid, data)| (*oid, data.clone()));
        Ok(next.map(|(oid, data)| NextObjectResults {
            oid,
            data: Some(data),
            callback_evict: false,
        }))
    }

    fn get_class_id(&self, _node_id: u64, _info: &[u8]) -> Result<u32> {
        Ok(1)
    }

    fn get_class_info(&self, _node_id: u64, class_id: u32) -> Result<Option<Vec<u8>>> {
        if class_id == 1 {
            Ok(Some(vec![1, 2, 3]))
        } else {
            Ok(None)
        }
    }
}

/// Applies commit batches to the mock server and records every item, so
/// tests can check what shipped and re-fetches observe committed state.
struct MockUpdateSender {
    server: Arc<MockServer>,
    items: Mutex<Vec<UpdateItem>>,
}

impl MockUpdateSender {
    fn new(server: Arc<MockServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            items: Mutex::new(Vec::new()),
        })
    }

    fn commits(&self) -> Vec<UpdateItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| matches!(item, UpdateItem::Commit(_)))
            .cloned()
            .collect()
    }
}

impl UpdateSender for MockUpdateSender {
    fn send(&self, item: UpdateItem) -> Result<()> {
        if let UpdateItem::Commit(batch) = &item {
            let mut state = self.server.state.lock();
            for update in &batch.object_updates {
                match &update.data {
                    Some(data) => {
                        state.objects.insert(update.oid, data.clone());
                    }
                    None => {
                        state.objects.remove(&update.oid);
                    }
                }
            }
            for update in &batch.binding_updates {
                if let BindingKey::Name(name) = &update.key {
                    match update.oid {
                        Some(oid) => {
                            state.bindings.insert(name.clone(), oid);
                        }
                        None => {
                            state.bindings.remove(name);
                        }
                    }
                }
            }
        }
        self.items.lock().push(item);
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

fn test_config() -> StoreConfig {
    StoreConfig {
        cache_size: 1000,
        eviction_batch_size: 50,
        eviction_reserve_size: 20,
        lock_timeout: Duration::from_millis(50),
        max_retry: Duration::from_millis(200),
        retry_wait: Duration::from_millis(2),
        object_id_batch_size: 100,
        ..Default::default()
    }
}

fn new_store() -> (CachingStore, Arc<MockServer>, Arc<MockUpdateSender>) {
    let server = MockServer::new();
    let sender = MockUpdateSender::new(Arc::clone(&server));
    let store = CachingStore::new(
        test_config(),
        Arc::clone(&server) as Arc<dyn StoreServer>,
        Arc::clone(&sender) as Arc<dyn UpdateSender>,
        1,
    )
    .unwrap();
    (store, server, sender)
}

fn txn(store: &CachingStore) -> TxnId {
    store.create_transaction(Duration::from_secs(5)).unwrap()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_set_binding_visible_after_commit() {
    let (store, _server, _sender) = new_store();

    let t1 = txn(&store);
    let result = store.set_binding(t1, "a", 7).unwrap();
    assert!(!result.is_bound());
    store.commit(t1).unwrap();

    let t2 = txn(&store);
    let result = store.get_binding(t2, "a").unwrap();
    assert_eq!(result.oid(), Some(7));
    assert_eq!(result.next_name, None);
    store.commit(t2).unwrap();
    store.shutdown();
}

#[test]
fn test_object_roundtrip() {
    let (store, _server, _sender) = new_store();

    let t1 = txn(&store);
    let oid = store.create_object(t1).unwrap();
    store.set_object(t1, oid, b"payload").unwrap();
    // Read-your-writes before commit.
    assert_eq!(store.get_object(t1, oid, false).unwrap(), b"payload");
    store.commit(t1).unwrap();

    let t2 = txn(&store);
    assert_eq!(store.get_object(t2, oid, false).unwrap(), b"payload");
    store.commit(t2).unwrap();
    store.shutdown();
}

#[test]
fn test_get_missing_object() {
    let (store, _server, _sender) = new_store();
    let t1 = txn(&store);
    assert!(matches!(
        store.get_object(t1, 424242, false),
        Err(JaalError::ObjectNotFound(424242))
    ));
    store.abort(t1).unwrap();
    store.shutdown();
}

#[test]
fn test_read_your_writes_and_abort() {
    let (store, server, _sender) = new_store();
    server.bind("m", 3);

    let t1 = txn(&store);
    assert_eq!(store.get_binding(t1, "m").unwrap().oid(), Some(3));
    let prior = store.set_binding(t1, "m", 9).unwrap();
    assert!(prior.is_bound());
    assert_eq!(store.get_binding(t1, "m").unwrap().oid(), Some(9));
    store.abort(t1).unwrap();

    // The abort restored the cached value.
    let t2 = txn(&store);
    assert_eq!(store.get_binding(t2, "m").unwrap().oid(), Some(3));
    store.commit(t2).unwrap();
    store.shutdown();
}

#[test]
fn test_set_binding_abort_removes_created_entry() {
    let (store, server, _sender) = new_store();

    let t1 = txn(&store);
    let result = store.set_binding(t1, "ghost", 5).unwrap();
    assert!(!result.is_bound());
    assert_eq!(store.get_binding(t1, "ghost").unwrap().oid(), Some(5));
    store.abort(t1).unwrap();

    let t2 = txn(&store);
    let result = store.get_binding(t2, "ghost").unwrap();
    assert!(!result.is_bound());
    store.commit(t2).unwrap();
    assert!(!server.has_binding("ghost"));
    store.shutdown();
}

#[test]
fn test_next_bound_name_caches_absence() {
    let (store, server, _sender) = new_store();
    server.bind("b", 5);

    let t1 = txn(&store);
    assert_eq!(
        store.next_bound_name(t1, Some("a")).unwrap(),
        Some("b".to_string())
    );
    let calls_after_first = server.call_count("next_bound_name");
    // A second query is answered from the cached certificate.
    assert_eq!(
        store.next_bound_name(t1, Some("a")).unwrap(),
        Some("b".to_string())
    );
    assert_eq!(server.call_count("next_bound_name"), calls_after_first);
    // Monotonic: a higher start never yields a lower answer.
    assert_eq!(store.next_bound_name(t1, Some("b")).unwrap(), None);
    store.commit(t1).unwrap();
    store.shutdown();
}

#[test]
fn test_unbound_range_certificate_covers_nearby_names() {
    let (store, server, _sender) = new_store();
    server.bind("m", 1);

    let t1 = txn(&store);
    let result = store.get_binding(t1, "g").unwrap();
    assert!(!result.is_bound());
    assert_eq!(result.next_name, Some("m".to_string()));
    let calls = server.call_count("get_binding");

    // "h" lies inside the certified range (g, m); no server call.
    let result = store.get_binding(t1, "h").unwrap();
    assert!(!result.is_bound());
    assert_eq!(server.call_count("get_binding"), calls);

    // "f" lies below the certificate; the server is consulted again.
    let result = store.get_binding(t1, "f").unwrap();
    assert!(!result.is_bound());
    assert!(server.call_count("get_binding") > calls);
    store.commit(t1).unwrap();
    store.shutdown();
}

#[test]
fn test_commit_ships_one_key_ordered_batch() {
    let (store, _server, sender) = new_store();

    let t1 = txn(&store);
    store.set_binding(t1, "zz", 2).unwrap();
    store.set_binding(t1, "aa", 1).unwrap();
    let oid = store.create_object(t1).unwrap();
    store.set_object(t1, oid, b"x").unwrap();
    store.commit(t1).unwrap();

    let commits = sender.commits();
    assert_eq!(commits.len(), 1);
    let UpdateItem::Commit(batch) = &commits[0] else {
        panic!("expected a commit batch");
    };
    assert_eq!(batch.created_oids, vec![oid]);
    assert_eq!(batch.object_updates.len(), 1);
    assert_eq!(batch.object_updates[0].data, Some(b"x".to_vec()));
    let keys: Vec<&BindingKey> = batch.binding_updates.iter().map(|u| &u.key).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert!(batch
        .binding_updates
        .iter()
        .any(|u| u.key == BindingKey::for_name("aa") && u.oid == Some(1)));
    assert!(batch
        .binding_updates
        .iter()
        .any(|u| u.key == BindingKey::for_name("zz") && u.oid == Some(2)));
    store.shutdown();
}

#[test]
fn test_remove_binding_updates_successor() {
    let (store, server, sender) = new_store();
    server.bind("x", 1);
    server.bind("y", 2);

    let t1 = txn(&store);
    let result = store.remove_binding(t1, "x").unwrap();
    assert!(result.is_bound());
    assert_eq!(result.next_name, Some("y".to_string()));
    // Removed within the transaction.
    assert!(!store.get_binding(t1, "x").unwrap().is_bound());
    store.commit(t1).unwrap();

    assert!(!server.has_binding("x"));
    assert!(server.has_binding("y"));
    let commits = sender.commits();
    assert_eq!(commits.len(), 1);
    let UpdateItem::Commit(batch) = &commits[0] else {
        panic!("expected a commit batch");
    };
    let tombstone = batch
        .binding_updates
        .iter()
        .find(|u| u.key == BindingKey::for_name("x"))
        .unwrap();
    assert_eq!(tombstone.oid, None);
    let successor = batch
        .binding_updates
        .iter()
        .find(|u| u.key == BindingKey::for_name("y"))
        .unwrap();
    assert_eq!(successor.oid, Some(2));
    // The successor's certificate now covers the removed name.
    assert_eq!(successor.previous_key, Some(BindingKey::for_name("x")));
    assert!(successor.previous_key_unbound);

    let t2 = txn(&store);
    assert!(!store.get_binding(t2, "x").unwrap().is_bound());
    assert_eq!(store.get_binding(t2, "y").unwrap().oid(), Some(2));
    store.commit(t2).unwrap();
    store.shutdown();
}

#[test]
fn test_remove_unbound_name() {
    let (store, server, _sender) = new_store();
    server.bind("z", 4);

    let t1 = txn(&store);
    let result = store.remove_binding(t1, "q").unwrap();
    assert!(!result.is_bound());
    assert_eq!(result.next_name, Some("z".to_string()));
    store.commit(t1).unwrap();
    store.shutdown();
}

#[test]
fn test_evict_callback_deferred_while_in_use() {
    let (store, server, _sender) = new_store();
    server.bind("k", 9);

    let t1 = txn(&store);
    let prior = store.set_binding(t1, "k", 10).unwrap();
    assert!(prior.is_bound());

    // The entry has an uncommitted write, so the server's evict request
    // cannot complete synchronously.
    assert!(!store.request_evict_binding(BindingKey::for_name("k")));

    store.commit(t1).unwrap();

    // Once the commit is acknowledged and the deferred task runs, the
    // entry is gone and a repeated request is trivially satisfied.
    assert!(wait_until(Duration::from_secs(5), || {
        store.request_evict_binding(BindingKey::for_name("k"))
    }));
    assert!(store.request_evict_binding(BindingKey::for_name("k")));
    assert!(server.has_binding("k"));
    store.shutdown();
}

#[test]
fn test_idempotent_object_callbacks() {
    let (store, server, _sender) = new_store();
    server.put_object(5, vec![1]);

    // Unknown objects are already evicted.
    assert!(store.request_evict_object(999));
    assert!(store.request_evict_object(999));

    let t1 = txn(&store);
    store.get_object(t1, 5, false).unwrap();
    store.commit(t1).unwrap();

    // A read-only entry needs no downgrade, twice.
    assert!(store.request_downgrade_object(5));
    assert!(store.request_downgrade_object(5));

    // Evicting the idle entry succeeds, and again once it is gone.
    assert!(wait_until(Duration::from_secs(5), || {
        store.request_evict_object(5)
    }));
    assert!(store.request_evict_object(5));
    store.shutdown();
}

#[test]
fn test_eviction_keeps_cache_at_capacity() {
    let (store, server, _sender) = new_store();
    for oid in 0..1200u64 {
        server.put_object(oid, vec![oid as u8]);
    }

    for oid in 0..1200u64 {
        let t = txn(&store);
        assert_eq!(store.get_object(t, oid, false).unwrap(), vec![oid as u8]);
        store.commit(t).unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        store.cached_entry_count() <= 1000
    }));
    store.shutdown();
}

#[test]
fn test_shutdown_rejects_new_transactions() {
    let (store, _server, _sender) = new_store();
    let t1 = txn(&store);
    store.commit(t1).unwrap();
    store.shutdown();
    assert!(matches!(
        store.create_transaction(Duration::from_secs(1)),
        Err(JaalError::Shutdown)
    ));
}

#[test]
fn test_class_registry() {
    let (store, _server, _sender) = new_store();
    let t1 = txn(&store);
    let class_id = store.get_class_id(t1, b"class-bytes").unwrap();
    assert_eq!(store.get_class_info(t1, class_id).unwrap(), vec![1, 2, 3]);
    assert!(matches!(
        store.get_class_info(t1, 77),
        Err(JaalError::ClassInfoNotFound(77))
    ));
    store.commit(t1).unwrap();
    store.shutdown();
}

#[test]
fn test_next_object_id_merges_local_creations() {
    let (store, server, _sender) = new_store();
    server.put_object(500_000, vec![9]);

    let t1 = txn(&store);
    let created = store.create_object(t1).unwrap();
    assert!(created < 500_000);
    let first = store.next_object_id(t1, None).unwrap();
    assert_eq!(first, Some(created));
    let second = store.next_object_id(t1, Some(created)).unwrap();
    assert_eq!(second, Some(500_000));
    store.commit(t1).unwrap();
    store.shutdown();
}
