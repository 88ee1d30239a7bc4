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

//! 2-means clustering for posting splits.
//!
//! Lloyd iterations seeded from a random shuffle, capped at the caller's
//! iteration budget with early convergence when assignments stop moving.
//! A degenerate input (all points identical) reports a single non-empty
//! cluster; the split engine treats that as a garbage-collection rewrite.

use rand::seq::SliceRandom;
use rand::thread_rng;

use canopy_core::{distance, normalize, DistanceKind};

pub struct TwoMeans {
    pub centers: [Vec<f32>; 2],
    /// Cluster of each input point (0 or 1).
    pub assignment: Vec<u8>,
    pub counts: [usize; 2],
}

impl TwoMeans {
    /// Non-empty clusters produced.
    pub fn cluster_count(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

pub fn two_means(points: &[Vec<f32>], kind: DistanceKind, max_iters: usize) -> Option<TwoMeans> {
    let n = points.len();
    if n < 2 {
        return None;
    }
    let dim = points[0].len();

    // Seed from a shuffle, skipping duplicate seeds where possible.
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut thread_rng());
    let seed_a = order[0];
    let seed_b = order[1..]
        .iter()
        .copied()
        .find(|&i| points[i] != points[seed_a])
        .unwrap_or(order[1]);

    let mut centers = [points[seed_a].clone(), points[seed_b].clone()];
    let mut assignment = vec![0u8; n];
    let mut counts = [0usize; 2];

    for _ in 0..max_iters.max(1) {
        // Assign.
        let mut moved = false;
        counts = [0, 0];
        for (i, point) in points.iter().enumerate() {
            let d0 = distance(kind, point, &centers[0]);
            let d1 = distance(kind, point, &centers[1]);
            let cluster = u8::from(d1 < d0);
            if assignment[i] != cluster {
                assignment[i] = cluster;
                moved = true;
            }
            counts[cluster as usize] += 1;
        }
        if counts[0] == 0 || counts[1] == 0 {
            break;
        }

        // Recenter.
        let mut sums = [vec![0f32; dim], vec![0f32; dim]];
        for (i, point) in points.iter().enumerate() {
            let sum = &mut sums[assignment[i] as usize];
            for (s, x) in sum.iter_mut().zip(point.iter()) {
                *s += x;
            }
        }
        for k in 0..2 {
            for s in sums[k].iter_mut() {
                *s /= counts[k] as f32;
            }
            if kind == DistanceKind::Cosine {
                normalize(&mut sums[k]);
            }
        }
        centers = [sums[0].clone(), sums[1].clone()];

        if !moved {
            break;
        }
    }

    Some(TwoMeans {
        centers,
        assignment,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_two_obvious_clusters() {
        let mut points = Vec::new();
        for i in 0..10 {
            points.push(vec![i as f32 * 0.01, 0.0]);
            points.push(vec![100.0 + i as f32 * 0.01, 0.0]);
        }
        let split = two_means(&points, DistanceKind::L2, 1000).unwrap();
        assert_eq!(split.cluster_count(), 2);
        assert_eq!(split.counts, [10, 10]);
        // all even indices landed together, all odd indices together
        let low_cluster = split.assignment[0];
        for (i, &c) in split.assignment.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(c, low_cluster);
            } else {
                assert_ne!(c, low_cluster);
            }
        }
    }

    #[test]
    fn identical_points_collapse_to_one_cluster() {
        let points = vec![vec![1.0, 1.0]; 8];
        let split = two_means(&points, DistanceKind::L2, 1000).unwrap();
        assert_eq!(split.cluster_count(), 1);
    }

    #[test]
    fn too_few_points_is_none() {
        assert!(two_means(&[vec![1.0]], DistanceKind::L2, 10).is_none());
    }
}
