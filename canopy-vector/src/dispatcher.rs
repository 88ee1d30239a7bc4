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

//! The dispatcher: a single cooperative task draining the assignment log.
//!
//! Each pass reads up to `batch` assignments. Insert replicas that are still
//! live are grouped per target head (source order preserved within the
//! batch) and handed to the append pool as one job per head; deletes set the
//! tombstone directly and skip posting rewrites entirely. An empty pass
//! sleeps 100 ms. Stopping is cooperative: the flag breaks the loop and
//! pending jobs drain in the pools.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use canopy_core::{HeadId, VectorRecord};
use canopy_storage::Assignment;

use crate::engine::{AppendJob, AppendOrigin, IndexInner};

const IDLE_SLEEP: Duration = Duration::from_millis(100);

pub(crate) struct Dispatcher {
    stop: Arc<AtomicBool>,
    consumed: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Start the dispatcher thread at `start_from` (the first unconsumed
    /// assignment id).
    pub(crate) fn start(inner: Weak<IndexInner>, start_from: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let consumed = Arc::new(AtomicU64::new(start_from));
        let busy = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let thread_consumed = consumed.clone();
        let thread_busy = busy.clone();
        let handle = std::thread::Builder::new()
            .name("canopy-dispatch".into())
            .spawn(move || run(inner, thread_stop, thread_consumed, thread_busy))
            .expect("dispatcher thread spawn");

        Self {
            stop,
            consumed,
            busy,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// First assignment id not yet consumed.
    pub(crate) fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Whether a dispatch pass is mid-flight (jobs read but not yet
    /// submitted).
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    inner: Weak<IndexInner>,
    stop: Arc<AtomicBool>,
    consumed: Arc<AtomicU64>,
    busy: Arc<AtomicBool>,
) {
    info!("dispatcher started");
    while !stop.load(Ordering::Acquire) {
        let Some(engine) = inner.upgrade() else {
            break;
        };
        busy.store(true, Ordering::Release);
        let processed = drain_batch(&engine, &consumed);
        busy.store(false, Ordering::Release);
        drop(engine);

        if processed == 0 {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
    busy.store(false, Ordering::Release);
    info!("dispatcher stopped");
}

/// One dispatch pass; returns the number of assignments consumed.
fn drain_batch(engine: &IndexInner, consumed: &AtomicU64) -> usize {
    let dim = engine.config.dim;
    let batch = engine.config.batch.max(1);
    let available = engine.log.next_id();

    // Per-head concatenation of still-live replicas, in source order.
    let mut grouped: Vec<(HeadId, usize, Vec<u8>)> = Vec::new();
    let mut slot_of_head = std::collections::HashMap::new();

    let mut processed = 0usize;
    while processed < batch {
        let id = consumed.load(Ordering::Acquire);
        if id >= available {
            break;
        }
        let bytes = match engine.log.get(id) {
            Ok(bytes) => bytes,
            Err(err) => {
                // Transient log read failure; retry this id next pass.
                error!(%err, id, "assignment read failed");
                break;
            }
        };
        consumed.fetch_add(1, Ordering::AcqRel);
        processed += 1;

        let assignment = match Assignment::decode(&bytes, dim) {
            Ok(assignment) => assignment,
            Err(err) => {
                // A poisoned record cannot be retried into health.
                error!(%err, id, "undecodable assignment skipped");
                continue;
            }
        };

        match assignment {
            Assignment::Insert { replicas } => {
                for replica in replicas {
                    if engine.versions.is_deleted(replica.vid)
                        || !engine.versions.check_valid(replica.vid, replica.version)
                    {
                        continue;
                    }
                    let slot = *slot_of_head.entry(replica.head).or_insert_with(|| {
                        grouped.push((replica.head, 0, Vec::new()));
                        grouped.len() - 1
                    });
                    let (_, count, blob) = &mut grouped[slot];
                    VectorRecord {
                        vid: replica.vid,
                        version: replica.version,
                        payload: replica.payload,
                    }
                    .encode_into(blob);
                    *count += 1;
                }
            }
            Assignment::Delete { vid } => {
                if let Err(err) = engine.versions.delete(vid) {
                    warn!(%err, vid, "tombstone set failed");
                }
            }
        }
    }

    for (head, count, blob) in grouped {
        if count == 0 {
            continue;
        }
        engine.submit_append(AppendJob {
            head,
            count,
            blob,
            origin: AppendOrigin::Insert,
        });
    }
    processed
}
