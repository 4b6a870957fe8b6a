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

//! Fixed-size worker pools for server fetches and deferred tasks.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named pool of worker threads draining a job channel. Jobs submitted
/// after shutdown are dropped; `shutdown` drains outstanding jobs before
/// joining.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let thread_name = format!("{}-{}", name, index);
            let builder = thread::Builder::new().name(thread_name.clone());
            match builder.spawn(move || {
                for job in receiver {
                    job();
                }
            }) {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(thread = %thread_name, error = %err, "could not spawn worker"),
            }
        }
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Submits a job. Returns `false` if the pool has shut down.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    /// Closes the job channel, lets workers drain, and joins them.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_jobs() {
        let pool = WorkerPool::new("test-pool", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_execute_after_shutdown() {
        let pool = WorkerPool::new("test-pool", 1);
        pool.shutdown();
        assert!(!pool.execute(|| {}));
    }
}
