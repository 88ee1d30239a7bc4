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

//! CanopyDB Storage
//!
//! On-storage halves of the index: the posting-list backends (a large-value
//! KV store and a 4 KiB raw-block allocator behind one tagged type) and the
//! durable append-only assignment log that decouples user writes from the
//! background update engine.

pub mod log;
pub mod store;

pub use log::{Assignment, AssignmentLog, ReplicaAssignment};
pub use store::{BlockPostingStore, KvPostingStore, PostingStore};
