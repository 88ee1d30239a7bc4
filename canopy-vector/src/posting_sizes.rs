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

//! Per-head posting-length counters.
//!
//! One atomic `u32` per head id: `fetch_add` under the shared append lock,
//! `store` under the exclusive split lock. The table over-approximates live
//! record counts between splits; a split restores equality.
//!
//! Serialized as the ssd-info file:
//! `vector_count:i32 | posting_count:u32 | size[0..posting_count]:u32` (LE).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use canopy_core::{CanopyError, HeadId, Result};

const SIZE_BLOCK: usize = 4096;

pub struct PostingSizeTable {
    blocks: RwLock<Vec<Arc<Vec<AtomicU32>>>>,
}

impl Default for PostingSizeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PostingSizeTable {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
        }
    }

    fn block_for(&self, head: HeadId) -> Arc<Vec<AtomicU32>> {
        let want = head as usize / SIZE_BLOCK;
        {
            let blocks = self.blocks.read();
            if let Some(block) = blocks.get(want) {
                return block.clone();
            }
        }
        let mut blocks = self.blocks.write();
        while blocks.len() <= want {
            blocks.push(Arc::new((0..SIZE_BLOCK).map(|_| AtomicU32::new(0)).collect()));
        }
        blocks[want].clone()
    }

    pub fn get(&self, head: HeadId) -> u32 {
        let blocks = self.blocks.read();
        match blocks.get(head as usize / SIZE_BLOCK) {
            Some(block) => block[head as usize % SIZE_BLOCK].load(Ordering::Acquire),
            None => 0,
        }
    }

    pub fn fetch_add(&self, head: HeadId, n: u32) {
        self.block_for(head)[head as usize % SIZE_BLOCK].fetch_add(n, Ordering::AcqRel);
    }

    pub fn store(&self, head: HeadId, n: u32) {
        self.block_for(head)[head as usize % SIZE_BLOCK].store(n, Ordering::Release);
    }
}

// ============================================================================
// ssd-info file
// ============================================================================

pub fn save_ssd_info(
    table: &PostingSizeTable,
    vector_count: i32,
    posting_count: u32,
    path: impl AsRef<Path>,
) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + posting_count as usize * 4);
    let mut word = [0u8; 4];
    LittleEndian::write_i32(&mut word, vector_count);
    buf.extend_from_slice(&word);
    LittleEndian::write_u32(&mut word, posting_count);
    buf.extend_from_slice(&word);
    for head in 0..posting_count {
        LittleEndian::write_u32(&mut word, table.get(head));
        buf.extend_from_slice(&word);
    }
    let mut file = File::create(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

pub fn load_ssd_info(path: impl AsRef<Path>) -> Result<(i32, PostingSizeTable)> {
    let mut raw = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut raw)?;
    if raw.len() < 8 {
        return Err(CanopyError::Corrupted("ssd-info file too short".into()));
    }
    let vector_count = LittleEndian::read_i32(&raw[0..4]);
    let posting_count = LittleEndian::read_u32(&raw[4..8]) as usize;
    if raw.len() != 8 + posting_count * 4 {
        return Err(CanopyError::Corrupted(format!(
            "ssd-info expects {} postings but file holds {} bytes",
            posting_count,
            raw.len()
        )));
    }
    let table = PostingSizeTable::new();
    for head in 0..posting_count {
        let at = 8 + head * 4;
        let size = LittleEndian::read_u32(&raw[at..at + 4]);
        if size != 0 {
            table.store(head as HeadId, size);
        }
    }
    Ok((vector_count, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counters_grow_on_demand() {
        let table = PostingSizeTable::new();
        assert_eq!(table.get(100_000), 0);
        table.fetch_add(100_000, 3);
        table.fetch_add(100_000, 2);
        assert_eq!(table.get(100_000), 5);
        table.store(100_000, 1);
        assert_eq!(table.get(100_000), 1);
    }

    #[test]
    fn ssd_info_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ssdinfo.bin");

        let table = PostingSizeTable::new();
        table.store(0, 4);
        table.store(2, 9);
        save_ssd_info(&table, 17, 3, &path).unwrap();

        let (vector_count, back) = load_ssd_info(&path).unwrap();
        assert_eq!(vector_count, 17);
        assert_eq!(back.get(0), 4);
        assert_eq!(back.get(1), 0);
        assert_eq!(back.get(2), 9);
    }
}
