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

//! Shared index state and the append/split half of the update engine.
//!
//! ```text
//!            AssignmentLog ──> Dispatcher ──> append pool ──┐
//!                                                           │ append()
//!                        ┌──────────────────────────────────┘
//!                        ▼
//!              per-head rw-lock registry
//!              shared: append posting, bump size
//!              exclusive: split → GC → 2-means → install heads
//!                        │
//!                        └──> reassign pool (displaced vectors)
//! ```
//!
//! `IndexInner` owns every service the index needs; the facade holds it in
//! an `Arc` and the dispatcher/worker pools hold `Weak` back-references, so
//! teardown is strictly bottom-up with no reference cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use canopy_core::{
    distance, DistanceKind, HeadId, IndexConfig, RecordCursor, Result, VectorId, VectorRecord,
};
use canopy_storage::{AssignmentLog, PostingStore};

use crate::head::{HeadIndex, IdAllocator};
use crate::kmeans::two_means;
use crate::pool::WorkerPool;
use crate::posting_sizes::PostingSizeTable;
use crate::version_map::VersionMap;

/// Extra headroom granted to reassignment-origin appends so they settle
/// instead of cascading into further splits.
pub(crate) const REASSIGN_SLACK: usize = 3;

/// A split cluster whose center lands this close to the old centroid keeps
/// its head id.
pub(crate) const CENTER_REUSE_EPSILON: f32 = 1e-6;

const KMEANS_MAX_ITERS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendOrigin {
    Insert,
    Reassign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendOutcome {
    Appended,
    /// Target head vanished; records were rerouted to the reassign pool.
    HeadMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitOutcome {
    Done,
    /// Overflow vanished under the exclusive lock; caller restarts as a
    /// plain append.
    Refused,
}

pub(crate) struct AppendJob {
    pub head: HeadId,
    pub count: usize,
    pub blob: Vec<u8>,
    pub origin: AppendOrigin,
}

pub(crate) struct ReassignJob {
    pub vid: VectorId,
    pub version: u8,
    pub prev_head: HeadId,
    pub payload: Vec<f32>,
}

#[derive(Default)]
pub(crate) struct EngineCounters {
    pub appends: AtomicU64,
    pub splits: AtomicU64,
    pub gc_rewrites: AtomicU64,
    pub head_misses: AtomicU64,
    pub reassigns: AtomicU64,
    pub backend_retries: AtomicU64,
}

/// Point-in-time view of the engine counters plus index shape.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub append_count: u64,
    pub split_count: u64,
    pub gc_rewrite_count: u64,
    pub head_miss_count: u64,
    pub reassign_count: u64,
    pub backend_retry_count: u64,
    pub head_count: usize,
    pub vector_count: u32,
}

pub(crate) struct IndexInner {
    pub(crate) config: IndexConfig,
    pub(crate) store: PostingStore,
    pub(crate) log: AssignmentLog,
    pub(crate) heads: Box<dyn HeadIndex>,
    pub(crate) versions: VersionMap,
    pub(crate) sizes: PostingSizeTable,
    pub(crate) ids: Arc<IdAllocator>,
    head_locks: DashMap<HeadId, Arc<RwLock<()>>>,
    append_pool: OnceLock<WorkerPool<AppendJob>>,
    reassign_pool: OnceLock<WorkerPool<ReassignJob>>,
    pub(crate) counters: EngineCounters,
}

impl IndexInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: IndexConfig,
        store: PostingStore,
        log: AssignmentLog,
        heads: Box<dyn HeadIndex>,
        versions: VersionMap,
        sizes: PostingSizeTable,
        ids: Arc<IdAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            log,
            heads,
            versions,
            sizes,
            ids,
            head_locks: DashMap::new(),
            append_pool: OnceLock::new(),
            reassign_pool: OnceLock::new(),
            counters: EngineCounters::default(),
        })
    }

    /// Spin up the append and reassign pools. Pools hold only weak handles
    /// back to the engine.
    pub(crate) fn start_workers(self: &Arc<Self>) {
        let weak: Weak<IndexInner> = Arc::downgrade(self);
        let pool = WorkerPool::new(
            "canopy-append",
            self.config.append_thread_num,
            move |job: AppendJob| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = inner.append(job.head, job.count, &job.blob, job.origin) {
                    error!(%err, head = job.head, "append job failed; discarded");
                }
            },
        );
        let _ = self.append_pool.set(pool);

        let weak: Weak<IndexInner> = Arc::downgrade(self);
        let pool = WorkerPool::new(
            "canopy-reassign",
            self.config.reassign_thread_num,
            move |job: ReassignJob| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.process_reassign(job);
            },
        );
        let _ = self.reassign_pool.set(pool);
        info!(
            append_threads = self.config.append_thread_num,
            reassign_threads = self.config.reassign_thread_num,
            "update engine workers started"
        );
    }

    pub(crate) fn shutdown_workers(&self) {
        if let Some(pool) = self.append_pool.get() {
            pool.shutdown();
        }
        if let Some(pool) = self.reassign_pool.get() {
            pool.shutdown();
        }
    }

    pub(crate) fn pools_idle(&self) -> bool {
        self.append_pool.get().map_or(true, |p| p.pending() == 0)
            && self.reassign_pool.get().map_or(true, |p| p.pending() == 0)
    }

    pub(crate) fn submit_append(&self, job: AppendJob) {
        match self.append_pool.get() {
            Some(pool) => pool.submit(job),
            None => {
                if let Err(err) = self.append(job.head, job.count, &job.blob, job.origin) {
                    error!(%err, head = job.head, "inline append failed");
                }
            }
        }
    }

    pub(crate) fn submit_reassign(&self, job: ReassignJob) {
        match self.reassign_pool.get() {
            Some(pool) => pool.submit(job),
            None => self.process_reassign(job),
        }
    }

    pub(crate) fn head_lock(&self, head: HeadId) -> Arc<RwLock<()>> {
        self.head_locks
            .entry(head)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn stats(&self) -> IndexStats {
        IndexStats {
            append_count: self.counters.appends.load(Ordering::Relaxed),
            split_count: self.counters.splits.load(Ordering::Relaxed),
            gc_rewrite_count: self.counters.gc_rewrites.load(Ordering::Relaxed),
            head_miss_count: self.counters.head_misses.load(Ordering::Relaxed),
            reassign_count: self.counters.reassigns.load(Ordering::Relaxed),
            backend_retry_count: self.counters.backend_retries.load(Ordering::Relaxed),
            head_count: self.heads.head_count(),
            vector_count: self.ids.current(),
        }
    }

    /// Records `(vid, version)` currently present in a head's posting,
    /// including stale ones. Diagnostics and invariant checks only.
    pub(crate) fn posting_records(&self, head: HeadId) -> Result<Vec<(VectorId, u8)>> {
        let blob = self.store.get(head)?;
        let cursor = RecordCursor::new(&blob, self.config.dim)?;
        Ok(cursor.map(|view| (view.vid, view.version)).collect())
    }

    // ========================================================================
    // Append
    // ========================================================================

    /// Append `count` records to a head's posting, splitting on overflow and
    /// rerouting to reassignment when the head has been deleted.
    pub(crate) fn append(
        &self,
        head: HeadId,
        count: usize,
        blob: &[u8],
        origin: AppendOrigin,
    ) -> Result<AppendOutcome> {
        if blob.is_empty() || count == 0 {
            warn!(head, count, "empty append request ignored");
            return Ok(AppendOutcome::Appended);
        }
        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        let slack = match origin {
            AppendOrigin::Insert => 0,
            AppendOrigin::Reassign => REASSIGN_SLACK,
        };
        let limit = self.config.posting_size_limit();

        loop {
            if !self.heads.contains(head) {
                self.counters.head_misses.fetch_add(1, Ordering::Relaxed);
                for view in RecordCursor::new(blob, self.config.dim)? {
                    if !self.versions.is_deleted(view.vid)
                        && self.versions.check_valid(view.vid, view.version)
                    {
                        self.submit_reassign(ReassignJob {
                            vid: view.vid,
                            version: view.version,
                            prev_head: head,
                            payload: view.payload(),
                        });
                    }
                }
                return Ok(AppendOutcome::HeadMissing);
            }

            if self.sizes.get(head) as usize + count > limit + slack {
                match self.split(head, count, blob)? {
                    SplitOutcome::Refused => continue,
                    SplitOutcome::Done => return Ok(AppendOutcome::Appended),
                }
            } else {
                let lock = self.head_lock(head);
                let _guard = lock.read();
                if !self.heads.contains(head) {
                    continue;
                }
                if let Err(err) = self.store.append(head, blob) {
                    warn!(%err, head, "posting append failed; retrying once");
                    self.counters.backend_retries.fetch_add(1, Ordering::Relaxed);
                    self.store.append(head, blob)?;
                }
                self.sizes.fetch_add(head, count as u32);
                return Ok(AppendOutcome::Appended);
            }
        }
    }

    // ========================================================================
    // Split
    // ========================================================================

    /// Split an overflowing posting under the head's exclusive lock.
    pub(crate) fn split(&self, head: HeadId, count: usize, blob: &[u8]) -> Result<SplitOutcome> {
        let lock = self.head_lock(head);
        let guard = lock.write();

        let limit = self.config.posting_size_limit();
        if (self.sizes.get(head) as usize + count) < limit {
            return Ok(SplitOutcome::Refused);
        }
        self.counters.splits.fetch_add(1, Ordering::Relaxed);

        let mut posting = self.store.get(head)?;
        posting.extend_from_slice(blob);

        // Garbage-collect stale and tombstoned records.
        let mut survivors: Vec<VectorRecord> = Vec::new();
        for view in RecordCursor::new(&posting, self.config.dim)? {
            if !self.versions.is_deleted(view.vid)
                && self.versions.check_valid(view.vid, view.version)
            {
                survivors.push(view.to_record());
            }
        }

        if survivors.is_empty() {
            // Nothing live remains; retire the head entirely.
            self.heads.remove(head);
            self.sizes.store(head, 0);
            self.store.delete(head)?;
            self.counters.gc_rewrites.fetch_add(1, Ordering::Relaxed);
            debug!(head, "split found no live records; head retired");
            return Ok(SplitOutcome::Done);
        }

        if survivors.len() < limit {
            self.override_posting(head, &survivors)?;
            self.counters.gc_rewrites.fetch_add(1, Ordering::Relaxed);
            return Ok(SplitOutcome::Done);
        }

        let points: Vec<Vec<f32>> = survivors.iter().map(|r| r.payload.clone()).collect();
        let clustering = two_means(&points, self.config.distance, KMEANS_MAX_ITERS);
        let clustering = match clustering {
            Some(c) if c.cluster_count() == 2 => c,
            _ => {
                debug!(head, records = survivors.len(), "clustering collapsed");
                self.override_posting(head, &survivors)?;
                self.counters.gc_rewrites.fetch_add(1, Ordering::Relaxed);
                return Ok(SplitOutcome::Done);
            }
        };

        let old_payload = self.heads.payload(head);
        let mut new_heads: Vec<HeadId> = Vec::with_capacity(2);
        let mut new_blobs: Vec<Vec<u8>> = Vec::with_capacity(2);
        let mut reused = false;

        for k in 0..2u8 {
            if clustering.counts[k as usize] == 0 {
                continue;
            }
            let mut cluster_blob = Vec::new();
            let mut cluster_len = 0u32;
            for (record, &assigned) in survivors.iter().zip(clustering.assignment.iter()) {
                if assigned == k {
                    record.encode_into(&mut cluster_blob);
                    cluster_len += 1;
                }
            }

            let center = &clustering.centers[k as usize];
            let reuse_here = !reused
                && old_payload
                    .as_deref()
                    .map(|old| distance(self.config.distance, center, old) < CENTER_REUSE_EPSILON)
                    .unwrap_or(false);
            let target = if reuse_here {
                reused = true;
                head
            } else {
                self.heads.add(center.clone())
            };
            self.store.put(target, &cluster_blob)?;
            self.sizes.store(target, cluster_len);
            new_heads.push(target);
            new_blobs.push(cluster_blob);
        }

        if !reused {
            self.heads.remove(head);
            self.sizes.store(head, 0);
            self.store.delete(head)?;
        }
        drop(guard);

        debug!(
            head,
            new_heads = ?new_heads,
            reused,
            "posting split installed"
        );

        if !self.config.disable_reassign {
            if let Some(old_payload) = old_payload {
                self.collect_reassign_candidates(head, &old_payload, &new_heads, &new_blobs)?;
            }
        }
        Ok(SplitOutcome::Done)
    }

    /// Rewrite a head's posting in place with exactly `records` (GC path).
    fn override_posting(&self, head: HeadId, records: &[VectorRecord]) -> Result<()> {
        let mut blob = Vec::with_capacity(
            records.len() * VectorRecord::wire_size(self.config.dim),
        );
        for record in records {
            record.encode_into(&mut blob);
        }
        self.store.put(head, &blob)?;
        self.sizes.store(head, records.len() as u32);
        Ok(())
    }

    pub(crate) fn distance_kind(&self) -> DistanceKind {
        self.config.distance
    }
}
