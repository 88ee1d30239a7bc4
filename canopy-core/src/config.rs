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

//! Index configuration.

use serde::{Deserialize, Serialize};

use crate::distance::DistanceKind;
use crate::types::VectorRecord;

/// Storage page size shared by the block backend and the split threshold
/// derivation.
pub const PAGE_SIZE: usize = 4096;

/// Tunables for a CanopyDB index.
///
/// `posting_size_limit` is normally derived from `posting_page_limit` and the
/// record size; tests override it directly through
/// [`IndexConfig::posting_size_limit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Vector dimensionality.
    pub dim: usize,
    /// Distance function for both routing and final scoring.
    pub distance: DistanceKind,
    /// Pages a posting list may occupy before a split is forced.
    pub posting_page_limit: usize,
    /// Explicit record-count split threshold; overrides the page derivation.
    pub posting_size_limit_override: Option<usize>,
    /// Per-insert replica fanout.
    pub replica_count: usize,
    /// Head-index candidate depth on the write path.
    pub internal_result_num: usize,
    /// Head-index candidate depth on the search path.
    pub search_internal_result_num: usize,
    /// Nearest-other-heads to scan after a split (0 disables).
    pub reassign_k: usize,
    /// RNG pruning strength for replica selection during reassignment (>= 1).
    pub rng_factor: f32,
    /// Read-path candidate pruning ratio (>= 1).
    pub max_dist_ratio: f32,
    /// Dispatcher batch size.
    pub batch: usize,
    pub append_thread_num: usize,
    pub reassign_thread_num: usize,
    pub search_thread_num: usize,
    /// Skip the post-split reassignment pass entirely.
    pub disable_reassign: bool,
    /// Microsecond deadline for backend posting reads.
    pub latency_limit_us: u64,
    /// Fraction of the build set promoted to heads.
    pub head_ratio: f64,
    /// Hard cap on version-map growth; exceeding it is fatal.
    pub max_vector_count: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            distance: DistanceKind::L2,
            posting_page_limit: 12,
            posting_size_limit_override: None,
            replica_count: 4,
            internal_result_num: 32,
            search_internal_result_num: 16,
            reassign_k: 0,
            rng_factor: 1.0,
            max_dist_ratio: 8.0,
            batch: 256,
            append_thread_num: 2,
            reassign_thread_num: 2,
            search_thread_num: 4,
            disable_reassign: false,
            latency_limit_us: 4000,
            head_ratio: 0.1,
            max_vector_count: 1 << 26,
        }
    }
}

impl IndexConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Record-count threshold at which a posting list must split.
    pub fn posting_size_limit(&self) -> usize {
        if let Some(limit) = self.posting_size_limit_override {
            return limit;
        }
        let record = VectorRecord::wire_size(self.dim);
        (self.posting_page_limit * PAGE_SIZE / record).max(1)
    }

    pub fn distance(mut self, kind: DistanceKind) -> Self {
        self.distance = kind;
        self
    }

    pub fn posting_size_limit_of(mut self, limit: usize) -> Self {
        self.posting_size_limit_override = Some(limit);
        self
    }

    pub fn replica_count(mut self, n: usize) -> Self {
        self.replica_count = n.clamp(1, 8);
        self
    }

    pub fn reassign_k(mut self, k: usize) -> Self {
        self.reassign_k = k;
        self
    }

    pub fn max_dist_ratio(mut self, ratio: f32) -> Self {
        self.max_dist_ratio = ratio.max(1.0);
        self
    }

    pub fn disable_reassign(mut self, disable: bool) -> Self {
        self.disable_reassign = disable;
        self
    }

    pub fn head_ratio(mut self, ratio: f64) -> Self {
        self.head_ratio = ratio.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_split_threshold() {
        let config = IndexConfig::new(128);
        // record = 4 + 1 + 512 = 517 bytes; 12 pages / 517 = 95 records
        assert_eq!(config.posting_size_limit(), 12 * PAGE_SIZE / 517);
    }

    #[test]
    fn override_wins_over_derivation() {
        let config = IndexConfig::new(128).posting_size_limit_of(5);
        assert_eq!(config.posting_size_limit(), 5);
    }

    #[test]
    fn config_serde_round_trip() {
        let config = IndexConfig::new(16).reassign_k(2).max_dist_ratio(2.0);
        let json = serde_json::to_string(&config).unwrap();
        let back: IndexConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dim, 16);
        assert_eq!(back.reassign_k, 2);
    }
}
