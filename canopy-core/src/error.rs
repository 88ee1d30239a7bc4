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

//! Error types for CanopyDB

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanopyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("index is not built yet")]
    EmptyIndex,

    #[error("operation received zero vectors")]
    EmptyData,

    #[error("data corruption detected: {0}")]
    Corrupted(String),

    #[error("version map cannot grow past its configured capacity")]
    MemoryOverflow,

    #[error("backend IO failed: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index is immutable; updates are disabled")]
    Immutable,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CanopyError>;
