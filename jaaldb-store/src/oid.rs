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

//! Batched object id allocation.
//!
//! Object ids come from the server in contiguous ranges. The allocator
//! hands them out locally, prefetches the next range before the current one
//! drains, and blocks callers only when both are empty. The store drives
//! the actual server call on its fetch pool; this type just manages the
//! ranges and the handoff.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use jaaldb_core::{JaalError, ObjectId, Result};
use jaaldb_net::ObjectIdRange;

struct Range {
    next: u64,
    last: u64,
}

impl Range {
    fn take(&mut self) -> Option<ObjectId> {
        if self.next > self.last {
            return None;
        }
        let oid = self.next;
        self.next += 1;
        Some(oid)
    }

    fn remaining(&self) -> u64 {
        (self.last + 1).saturating_sub(self.next)
    }
}

struct IdState {
    current: Option<Range>,
    next: Option<Range>,
    fetching: bool,
    failed: bool,
    shut_down: bool,
}

pub(crate) struct NewObjectIdCache {
    batch_size: u64,
    state: Mutex<IdState>,
    cond: Condvar,
}

impl NewObjectIdCache {
    pub(crate) fn new(batch_size: u64) -> Self {
        Self {
            batch_size,
            state: Mutex::new(IdState {
                current: None,
                next: None,
                fetching: false,
                failed: false,
                shut_down: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Takes an id if one is locally available, rotating in the prefetched
    /// range when the current one drains.
    pub(crate) fn try_take(&self) -> Option<ObjectId> {
        let mut state = self.state.lock();
        loop {
            if let Some(current) = state.current.as_mut() {
                if let Some(oid) = current.take() {
                    return Some(oid);
                }
                state.current = None;
            }
            match state.next.take() {
                Some(range) => state.current = Some(range),
                None => return None,
            }
        }
    }

    /// Whether a fetch should be scheduled now. Claims the fetch slot when
    /// answering `true`, so exactly one fetch is in flight.
    pub(crate) fn begin_fetch(&self) -> bool {
        let mut state = self.state.lock();
        if state.fetching || state.shut_down {
            return false;
        }
        if state.next.is_some() {
            return false;
        }
        state.fetching = true;
        state.failed = false;
        true
    }

    /// Whether the current range is low enough to warrant a prefetch.
    pub(crate) fn should_prefetch(&self) -> bool {
        let state = self.state.lock();
        if state.next.is_some() || state.fetching || state.shut_down {
            return false;
        }
        match &state.current {
            Some(range) => range.remaining() <= self.batch_size / 10,
            None => true,
        }
    }

    /// Installs a freshly allocated range.
    pub(crate) fn install(&self, range: ObjectIdRange) {
        let mut state = self.state.lock();
        state.fetching = false;
        state.failed = false;
        let incoming = Range {
            next: range.first,
            last: range.last,
        };
        if state.current.is_none() {
            state.current = Some(incoming);
        } else {
            state.next = Some(incoming);
        }
        self.cond.notify_all();
    }

    pub(crate) fn fetch_failed(&self) {
        let mut state = self.state.lock();
        state.fetching = false;
        state.failed = true;
        self.cond.notify_all();
    }

    /// Blocks until an id is available, the fetch fails, or the deadline
    /// passes.
    pub(crate) fn await_available(&self, stop: Instant) -> Result<()> {
        let started = Instant::now();
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return Err(JaalError::Shutdown);
            }
            if state.failed {
                return Err(JaalError::Network(
                    "object id allocation failed".to_string(),
                ));
            }
            let available = state
                .current
                .as_ref()
                .map_or(false, |range| range.remaining() > 0)
                || state.next.is_some();
            if available {
                return Ok(());
            }
            if Instant::now() >= stop {
                return Err(JaalError::TxnTimeout {
                    waited: started.elapsed(),
                });
            }
            self.cond.wait_until(&mut state, stop);
        }
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hands_out_contiguous_ids() {
        let cache = NewObjectIdCache::new(10);
        assert!(cache.try_take().is_none());
        assert!(cache.begin_fetch());
        assert!(!cache.begin_fetch());
        cache.install(ObjectIdRange { first: 5, last: 7 });
        assert_eq!(cache.try_take(), Some(5));
        assert_eq!(cache.try_take(), Some(6));
        assert_eq!(cache.try_take(), Some(7));
        assert!(cache.try_take().is_none());
    }

    #[test]
    fn test_rotates_prefetched_range() {
        let cache = NewObjectIdCache::new(10);
        assert!(cache.begin_fetch());
        cache.install(ObjectIdRange { first: 1, last: 1 });
        assert!(cache.begin_fetch());
        cache.install(ObjectIdRange { first: 10, last: 11 });
        assert_eq!(cache.try_take(), Some(1));
        assert_eq!(cache.try_take(), Some(10));
        assert_eq!(cache.try_take(), Some(11));
        assert!(cache.try_take().is_none());
    }

    #[test]
    fn test_prefetch_threshold() {
        let cache = NewObjectIdCache::new(100);
        assert!(cache.should_prefetch());
        assert!(cache.begin_fetch());
        cache.install(ObjectIdRange { first: 0, last: 99 });
        assert!(!cache.should_prefetch());
        for _ in 0..90 {
            cache.try_take();
        }
        assert!(cache.should_prefetch());
    }

    #[test]
    fn test_await_times_out() {
        let cache = NewObjectIdCache::new(10);
        let err = cache
            .await_available(Instant::now() + Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, JaalError::TxnTimeout { .. }));
    }

    #[test]
    fn test_failed_fetch_raises_network_error() {
        let cache = NewObjectIdCache::new(10);
        assert!(cache.begin_fetch());
        cache.fetch_failed();
        let err = cache
            .await_available(Instant::now() + Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, JaalError::Network(_)));
    }
}
