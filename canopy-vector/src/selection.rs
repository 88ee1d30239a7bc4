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

//! Replica placement with relative-neighborhood pruning.
//!
//! Candidate heads arrive sorted by distance to the vector. A candidate is
//! accepted only if, for every head already accepted, `factor *
//! dist(candidate_head, accepted_head) > dist(vector, candidate_head)`.
//! With factor 1 this is the classic RNG edge test; larger factors prune
//! less aggressively and admit more replicas.

use smallvec::SmallVec;

use canopy_core::{distance, DistanceKind, HeadId};

use crate::head::HeadIndex;

pub type ReplicaSet = SmallVec<[(HeadId, f32); 8]>;

pub fn select_replicas(
    heads: &dyn HeadIndex,
    kind: DistanceKind,
    candidates: &[(HeadId, f32)],
    replica_count: usize,
    factor: f32,
) -> ReplicaSet {
    let mut selected = ReplicaSet::new();
    for &(candidate, dist) in candidates {
        if selected.len() >= replica_count {
            break;
        }
        let Some(candidate_payload) = heads.payload(candidate) else {
            continue;
        };
        let accepted = selected.iter().all(|&(chosen, _)| {
            match heads.payload(chosen) {
                Some(chosen_payload) => {
                    factor * distance(kind, &candidate_payload, &chosen_payload) > dist
                }
                None => true,
            }
        });
        if accepted {
            selected.push((candidate, dist));
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::{FlatHeadIndex, IdAllocator};
    use canopy_core::DistanceKind;
    use std::sync::Arc;

    #[test]
    fn rng_filter_rejects_clustered_heads() {
        let index = FlatHeadIndex::new(DistanceKind::L2, Arc::new(IdAllocator::new()));
        let near = index.add(vec![1.0, 0.0]);
        // a second head right next to the first: the edge near->crowded is
        // shorter than the vector->crowded edge, so RNG drops it
        let crowded = index.add(vec![1.2, 0.0]);
        let far = index.add(vec![0.0, 5.0]);

        let query = [0.0f32, 0.0];
        let candidates = index.search(&query, 3);
        let selected = select_replicas(&index, DistanceKind::L2, &candidates, 3, 1.0);

        let picked: Vec<_> = selected.iter().map(|&(h, _)| h).collect();
        assert!(picked.contains(&near));
        assert!(picked.contains(&far));
        assert!(!picked.contains(&crowded));
    }

    #[test]
    fn replica_count_caps_selection() {
        let index = FlatHeadIndex::new(DistanceKind::L2, Arc::new(IdAllocator::new()));
        // heads on a cross: every pair is farther apart than the query is
        // from any of them, so RNG accepts all and only the cap limits us
        index.add(vec![10.0, 0.0]);
        index.add(vec![0.0, 10.0]);
        index.add(vec![-10.0, 0.0]);
        index.add(vec![0.0, -10.0]);
        let candidates = index.search(&[0.0, 0.0], 4);
        let selected = select_replicas(&index, DistanceKind::L2, &candidates, 2, 1.0);
        assert_eq!(selected.len(), 2);
    }
}
