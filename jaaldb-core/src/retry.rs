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

//! Retry policy for transient server I/O.
//!
//! Every call to the authoritative server can fail transiently. Callers
//! retry with a fixed wait between attempts until a total deadline passes,
//! after which the failure is treated as permanent and escalated.

use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::Result;

/// How long to keep retrying and how long to pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry: Duration,
    pub retry_wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry: Duration, retry_wait: Duration) -> Self {
        Self {
            max_retry,
            retry_wait,
        }
    }

    /// Start tracking a single logical operation.
    pub fn start(&self) -> IoRetry {
        IoRetry {
            policy: *self,
            started: Instant::now(),
        }
    }
}

/// Retry state for one logical operation.
pub struct IoRetry {
    policy: RetryPolicy,
    started: Instant,
}

impl IoRetry {
    /// Whether the operation should be attempted again. Sleeps the retry
    /// wait before answering `true`.
    pub fn should_retry(&mut self) -> bool {
        if self.started.elapsed() >= self.policy.max_retry {
            return false;
        }
        thread::sleep(self.policy.retry_wait);
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Runs `op`, retrying transient failures under `policy`. The final error is
/// returned once the deadline passes; non-transient errors are returned
/// immediately.
pub fn run_io<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut retry = policy.start();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                if !retry.should_retry() {
                    return Err(err);
                }
                trace!(elapsed = ?retry.elapsed(), "retrying I/O operation");
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JaalError;
    use std::io;

    fn transient() -> JaalError {
        JaalError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(1))
    }

    #[test]
    fn test_retries_until_success() {
        let mut attempts = 0;
        let result = run_io(&quick_policy(), || {
            attempts += 1;
            if attempts < 3 {
                Err(transient())
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up_after_deadline() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(2));
        let started = Instant::now();
        let result: Result<()> = run_io(&policy, || Err(transient()));
        assert!(matches!(result, Err(JaalError::Io(_))));
        assert!(started.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let mut attempts = 0;
        let result: Result<()> = run_io(&quick_policy(), || {
            attempts += 1;
            Err(JaalError::Network("gone".into()))
        });
        assert!(matches!(result, Err(JaalError::Network(_))));
        assert_eq!(attempts, 1);
    }
}
