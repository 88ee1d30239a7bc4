// SPDX-License-Identifier: AGPL-3.0-or-later
// CanopyDB - Streaming Disk-Backed Vector Search
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

//! Fixed-size worker pools with unbounded FIFO queues.
//!
//! Workers drain the queue cooperatively: a stop request lets queued jobs
//! finish before the threads exit. `pending()` counts jobs queued or
//! executing, which is what drain/all-finished checks need. A panicking job
//! is logged and discarded; it never unwinds through the pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

pub struct WorkerPool<J: Send + 'static> {
    name: &'static str,
    tx: Sender<J>,
    pending: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    pub fn new<F>(name: &'static str, threads: usize, handler: F) -> Self
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        let (tx, rx) = unbounded::<J>();
        let pending = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(threads.max(1));
        for worker in 0..threads.max(1) {
            let rx = rx.clone();
            let pending = pending.clone();
            let running = running.clone();
            let handler = handler.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, worker))
                    .spawn(move || loop {
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(job) => {
                                let outcome = catch_unwind(AssertUnwindSafe(|| handler(job)));
                                pending.fetch_sub(1, Ordering::AcqRel);
                                if outcome.is_err() {
                                    error!(pool = name, "worker job panicked; job discarded");
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                if !running.load(Ordering::Acquire) && rx.is_empty() {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    })
                    .expect("worker thread spawn"),
            );
        }
        debug!(pool = name, threads = workers.len(), "worker pool started");

        Self {
            name,
            tx,
            pending,
            running,
            workers: Mutex::new(workers),
        }
    }

    pub fn submit(&self, job: J) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            error!(pool = self.name, "submit after shutdown; job dropped");
        }
    }

    /// Jobs queued or currently executing.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Let queued jobs finish, then join the threads.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        debug!(pool = self.name, "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn jobs_run_and_pending_settles() {
        let done = Arc::new(AtomicU64::new(0));
        let seen = done.clone();
        let pool = WorkerPool::new("test", 2, move |n: u64| {
            seen.fetch_add(n, Ordering::Relaxed);
        });
        for i in 0..100u64 {
            pool.submit(i);
        }
        while pool.pending() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::Relaxed), (0..100).sum::<u64>());
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let done = Arc::new(AtomicU64::new(0));
        let seen = done.clone();
        let pool = WorkerPool::new("drain", 1, move |_: ()| {
            std::thread::sleep(Duration::from_millis(1));
            seen.fetch_add(1, Ordering::Relaxed);
        });
        for _ in 0..50 {
            pool.submit(());
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::Relaxed), 50);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn panicking_job_is_discarded() {
        let pool = WorkerPool::new("panic", 1, |fail: bool| {
            if fail {
                panic!("boom");
            }
        });
        pool.submit(true);
        pool.submit(false);
        while pool.pending() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();
    }
}
