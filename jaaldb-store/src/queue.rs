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

//! The update queue.
//!
//! Committed changes ship to the server through a bounded channel drained
//! by one worker thread. The worker sends each item and blocks for the
//! server's acknowledgement before touching the next, which yields the two
//! ordering guarantees everything else relies on: items leave in enqueue
//! order, and an evict enqueued after a commit for the same key is only
//! sent once the commit is acknowledged.
//!
//! The queue also owns settledness: every transaction's context id is
//! registered at join and deregistered when the transaction finishes with
//! nothing to ship or when its commit batch is acknowledged. An entry whose
//! `context_id` is at or below [`UpdateQueue::highest_settled_context_id`]
//! has no dependence on in-flight work and may be evicted without waiting.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::warn;

use jaaldb_core::{run_io, BindingKey, JaalError, ObjectId, Result, RetryPolicy};
use jaaldb_net::{BindingUpdate, CommitBatch, ObjectUpdate, UpdateItem, UpdateSender};

/// Runs when the server acknowledges (or permanently fails) an evict or
/// downgrade item. Handlers re-look entries up by key; they never hold
/// entry references across the I/O.
pub(crate) type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

// =============================================================================
// Context settledness
// =============================================================================

struct TrackerState {
    pending: BTreeSet<u64>,
    highest_started: u64,
}

/// Tracks which transaction contexts may still have unshipped effects.
pub(crate) struct ContextTracker {
    state: Mutex<TrackerState>,
}

impl ContextTracker {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                pending: BTreeSet::new(),
                highest_started: 0,
            }),
        }
    }

    pub(crate) fn note_started(&self, context_id: u64) {
        let mut state = self.state.lock();
        state.pending.insert(context_id);
        if context_id > state.highest_started {
            state.highest_started = context_id;
        }
    }

    pub(crate) fn note_finished(&self, context_id: u64) {
        self.state.lock().pending.remove(&context_id);
    }

    /// The largest context id such that every context at or below it has
    /// finished and had its commit acknowledged.
    pub(crate) fn highest_settled(&self) -> u64 {
        let state = self.state.lock();
        match state.pending.iter().next() {
            Some(first) => first.saturating_sub(1),
            None => state.highest_started,
        }
    }
}

// =============================================================================
// Update queue
// =============================================================================

enum QueueItem {
    Commit {
        context_id: u64,
        batch: CommitBatch,
    },
    Op {
        item: UpdateItem,
        completion: Completion,
    },
}

pub(crate) struct UpdateQueue {
    node_id: u64,
    sender: Mutex<Option<Sender<QueueItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    tracker: Arc<ContextTracker>,
}

impl UpdateQueue {
    pub(crate) fn new(
        node_id: u64,
        capacity: usize,
        update_sender: Arc<dyn UpdateSender>,
        retry: RetryPolicy,
        on_failure: Arc<dyn Fn(JaalError) + Send + Sync>,
        on_settled: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (sender, receiver) = bounded::<QueueItem>(capacity);
        let tracker = Arc::new(ContextTracker::new());
        let worker_tracker = Arc::clone(&tracker);
        let worker = thread::Builder::new()
            .name("jaaldb-update-queue".to_string())
            .spawn(move || {
                for item in receiver {
                    match item {
                        QueueItem::Commit { context_id, batch } => {
                            let result =
                                run_io(&retry, || update_sender.send(UpdateItem::Commit(batch.clone())));
                            match result {
                                Ok(()) => {
                                    worker_tracker.note_finished(context_id);
                                    on_settled();
                                }
                                Err(err) => {
                                    warn!(context_id, error = %err, "commit shipment failed");
                                    on_failure(err);
                                }
                            }
                        }
                        QueueItem::Op { item, completion } => {
                            let result = run_io(&retry, || update_sender.send(item.clone()));
                            completion(result);
                        }
                    }
                }
            })
            .ok();
        if worker.is_none() {
            warn!("could not spawn the update queue worker");
        }
        Self {
            node_id,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(worker),
            tracker,
        }
    }

    pub(crate) fn note_context_started(&self, context_id: u64) {
        self.tracker.note_started(context_id);
    }

    /// Marks a context finished without a commit batch (read-only commit or
    /// abort).
    pub(crate) fn note_context_finished(&self, context_id: u64) {
        self.tracker.note_finished(context_id);
    }

    pub(crate) fn highest_settled_context_id(&self) -> u64 {
        self.tracker.highest_settled()
    }

    fn enqueue(&self, item: QueueItem) -> Result<()> {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender
                .send(item)
                .map_err(|_| JaalError::Shutdown),
            None => Err(JaalError::Shutdown),
        }
    }

    /// Enqueues a transaction's atomic batch. Blocks only while the queue
    /// is at capacity; the context settles when the batch is acknowledged.
    pub(crate) fn commit(
        &self,
        context_id: u64,
        created_oids: Vec<ObjectId>,
        object_updates: Vec<ObjectUpdate>,
        binding_updates: Vec<BindingUpdate>,
    ) -> Result<()> {
        let batch = CommitBatch {
            node_id: self.node_id,
            context_id,
            created_oids,
            object_updates,
            binding_updates,
        };
        self.enqueue(QueueItem::Commit { context_id, batch })
    }

    pub(crate) fn evict_object(&self, oid: ObjectId, completion: Completion) {
        let item = UpdateItem::EvictObject {
            node_id: self.node_id,
            oid,
        };
        self.enqueue_op(item, completion);
    }

    pub(crate) fn evict_binding(&self, key: BindingKey, completion: Completion) {
        let item = UpdateItem::EvictBinding {
            node_id: self.node_id,
            key,
        };
        self.enqueue_op(item, completion);
    }

    pub(crate) fn downgrade_object(&self, oid: ObjectId, completion: Completion) {
        let item = UpdateItem::DowngradeObject {
            node_id: self.node_id,
            oid,
        };
        self.enqueue_op(item, completion);
    }

    pub(crate) fn downgrade_binding(&self, key: BindingKey, completion: Completion) {
        let item = UpdateItem::DowngradeBinding {
            node_id: self.node_id,
            key,
        };
        self.enqueue_op(item, completion);
    }

    fn enqueue_op(&self, item: UpdateItem, completion: Completion) {
        if self.enqueue(QueueItem::Op { item, completion }).is_err() {
            warn!("update item dropped after shutdown");
        }
    }

    /// Closes the channel, lets the worker drain outstanding items, and
    /// joins it.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for UpdateQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
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

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1))
    }

    fn new_queue(sender: Arc<RecordingSender>) -> UpdateQueue {
        UpdateQueue::new(
            1,
            16,
            sender,
            policy(),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        )
    }

    #[test]
    fn test_fifo_order_and_completion() {
        let sender = Arc::new(RecordingSender {
            items: Mutex::new(Vec::new()),
        });
        let queue = new_queue(Arc::clone(&sender));

        queue.note_context_started(1);
        queue.commit(1, vec![], vec![], vec![]).unwrap();
        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        queue.evict_binding(
            BindingKey::for_name("k"),
            Box::new(move |result| {
                assert!(result.is_ok());
                flag.store(true, Ordering::SeqCst);
            }),
        );
        queue.shutdown();

        let items = sender.items.lock();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], UpdateItem::Commit(_)));
        assert!(matches!(items[1], UpdateItem::EvictBinding { .. }));
        assert!(completed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_settledness() {
        let sender = Arc::new(RecordingSender {
            items: Mutex::new(Vec::new()),
        });
        let queue = new_queue(sender);

        assert_eq!(queue.highest_settled_context_id(), 0);
        queue.note_context_started(1);
        queue.note_context_started(2);
        assert_eq!(queue.highest_settled_context_id(), 0);

        // Context 1 finishes read-only; context 2 still active.
        queue.note_context_finished(1);
        assert_eq!(queue.highest_settled_context_id(), 1);

        // Context 2 commits and the batch is acknowledged.
        queue.commit(2, vec![], vec![], vec![]).unwrap();
        queue.shutdown();
        assert_eq!(queue.highest_settled_context_id(), 2);
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let sender = Arc::new(RecordingSender {
            items: Mutex::new(Vec::new()),
        });
        let queue = new_queue(sender);
        queue.shutdown();
        assert!(matches!(
            queue.commit(1, vec![], vec![], vec![]),
            Err(JaalError::Shutdown)
        ));
    }
}
