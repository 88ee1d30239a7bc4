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

//! CanopyDB Core
//!
//! Shared vocabulary for the CanopyDB workspace: dense 32-bit ids, the
//! posting-record wire codec, distance kernels, the index configuration, and
//! the crate-wide error enum. Everything here is storage- and
//! threading-agnostic; the interesting machinery lives in `canopy-storage`
//! and `canopy-vector`.

pub mod config;
pub mod distance;
pub mod error;
pub mod types;

pub use config::{IndexConfig, PAGE_SIZE};
pub use distance::{distance, normalize, DistanceKind};
pub use error::{CanopyError, Result};
pub use types::{HeadId, RecordCursor, RecordView, VectorId, VectorRecord};
