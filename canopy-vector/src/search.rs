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

//! The read path.
//!
//! Route the query through the head index, prune candidate heads by the
//! distance ratio, bulk-read the selected postings under the backend
//! deadline, drop stale and tombstoned records against the version map, and
//! merge survivors into a bounded top-k. Readers take no locks beyond the
//! backend's own per-key synchronization, so they never wait on splits.

use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use rayon::prelude::*;

use canopy_core::{distance, normalize, CanopyError, DistanceKind, RecordCursor, Result, VectorId};

use crate::engine::IndexInner;
use crate::head::HeadIndex;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub vid: VectorId,
    pub distance: f32,
}

/// Max-heap entry: "worse" (greater) means farther, ties broken so the
/// larger vid is evicted first, leaving results ordered by ascending vid on
/// equal distance.
#[derive(Debug, PartialEq)]
struct HeapEntry(Neighbor);

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then(self.0.vid.cmp(&other.0.vid))
    }
}

impl IndexInner {
    pub(crate) fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_with_ratio(query, k, self.config.max_dist_ratio)
    }

    pub(crate) fn search_with_ratio(
        &self,
        query: &[f32],
        k: usize,
        max_dist_ratio: f32,
    ) -> Result<Vec<Neighbor>> {
        if query.len() != self.config.dim {
            return Err(CanopyError::InvalidArgument(format!(
                "query dimension {} != index dimension {}",
                query.len(),
                self.config.dim
            )));
        }
        if self.heads.head_count() == 0 {
            return Err(CanopyError::EmptyIndex);
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let kind = self.config.distance;
        let owned_query: Vec<f32>;
        let query: &[f32] = if kind == DistanceKind::Cosine {
            let mut q = query.to_vec();
            normalize(&mut q);
            owned_query = q;
            &owned_query
        } else {
            query
        };

        // Route, then prune by the distance ratio anchored at the best head.
        let routed = self
            .heads
            .search(query, self.config.search_internal_result_num);
        if routed.is_empty() {
            return Ok(Vec::new());
        }
        let limit = routed[0].1 * max_dist_ratio;
        let mut selected = Vec::with_capacity(routed.len());
        for &(head, dist) in &routed {
            if limit > 0.1 && dist > limit {
                break;
            }
            selected.push(head);
        }

        let deadline = Duration::from_micros(self.config.latency_limit_us);
        let blobs = self.store.multi_get(&selected, deadline)?;

        // Score and version-filter each posting; stale records are dropped,
        // never surfaced.
        let dim = self.config.dim;
        let scored: Result<Vec<Vec<Neighbor>>> = blobs
            .par_iter()
            .map(|blob| {
                let mut out = Vec::new();
                for view in RecordCursor::new(blob, dim)? {
                    if self.versions.is_deleted(view.vid)
                        || !self.versions.check_valid(view.vid, view.version)
                    {
                        continue;
                    }
                    let payload = view.payload();
                    out.push(Neighbor {
                        vid: view.vid,
                        distance: distance(kind, query, &payload),
                    });
                }
                Ok(out)
            })
            .collect();

        // Replicas surface the same vid from several postings; keep the best.
        let mut best: HashMap<VectorId, f32> = HashMap::new();
        for neighbor in scored?.into_iter().flatten() {
            match best.entry(neighbor.vid) {
                Entry::Vacant(slot) => {
                    slot.insert(neighbor.distance);
                }
                Entry::Occupied(mut slot) => {
                    if neighbor.distance < *slot.get() {
                        slot.insert(neighbor.distance);
                    }
                }
            }
        }

        // Bounded top-k merge.
        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
        for (vid, dist) in best {
            let entry = HeapEntry(Neighbor {
                vid,
                distance: dist,
            });
            if heap.len() < k {
                heap.push(entry);
            } else if let Some(worst) = heap.peek() {
                if entry < *worst {
                    heap.push(entry);
                    heap.pop();
                }
            }
        }

        let mut results: Vec<Neighbor> = heap.into_iter().map(|e| e.0).collect();
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.vid.cmp(&b.vid)));
        Ok(results)
    }
}
