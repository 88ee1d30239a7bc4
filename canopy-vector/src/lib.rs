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

//! CanopyDB Vector Index
//!
//! A streaming, updatable, disk-backed approximate nearest-neighbor index.
//! An in-memory head (centroid) index routes queries and inserts to
//! on-storage posting lists; a background update engine appends to postings,
//! splits overloaded ones via 2-means, promotes new centroids, and
//! opportunistically reassigns displaced vectors, all while readers run
//! concurrently.
//!
//! # Architecture
//!
//! ```text
//! add/delete ──> AssignmentLog ──> Dispatcher ──> append pool ──┐
//!                                                              ▼
//!                                              postings (KV or block store)
//!                                                              │
//!                                      split ──> reassign pool ┘
//!
//! search ──> HeadIndex ──> multi-get postings ──> version filter ──> top-k
//! ```
//!
//! Consistency is version-based: a record is live iff its tombstone is clear
//! and its version byte matches the version map. Reassignment bumps the map
//! entry with a CAS, instantly staling superseded records; readers filter,
//! splits physically collect.
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_core::IndexConfig;
//! use canopy_vector::CanopyIndex;
//!
//! let config = IndexConfig::new(4).posting_size_limit_of(8);
//! let index = CanopyIndex::build(config, &seed_vectors)?;
//! let ids = index.add(&more_vectors)?;
//! index.drain();
//! let hits = index.search(&query, 10)?;
//! ```

mod dispatcher;
mod engine;
pub mod head;
pub mod index;
pub mod kmeans;
pub mod pool;
pub mod posting_sizes;
mod reassign;
pub mod search;
pub mod selection;
pub mod version_map;

pub use engine::IndexStats;
pub use head::{FlatHeadIndex, HeadIndex, IdAllocator};
pub use index::CanopyIndex;
pub use search::Neighbor;
pub use version_map::VersionMap;

// Re-export the configuration surface so most callers need one crate only.
pub use canopy_core::{CanopyError, DistanceKind, IndexConfig, Result};
